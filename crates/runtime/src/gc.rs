//! The collection driver: root discovery and finalization.
//!
//! The heap owns mark and sweep; this module owns *when* they run and what
//! counts as a root. A cycle goes:
//!
//! 1. gather roots: operand stack up to `stack_top`, frame functions, the
//!    module registry's values, live handles, the temp-root stack, the
//!    current native, and everything still waiting in the finalization
//!    queue;
//! 2. mark;
//! 3. sweep — the heap runs native finalizers on dead instances and
//!    references, frees plain garbage, and hands back the objects whose
//!    class chain defines a script `dtor`;
//! 4. run those `dtor`s best-effort (errors swallowed, re-entrant
//!    collection suppressed by `gc_running`), after which each object is
//!    `Finalized` and the next sweep frees it — finalizers never run
//!    twice;
//! 5. reset the trigger threshold from the surviving byte count.
//!
//! Collections are requested by allocation (`gc_pending`) and performed at
//! safe points: the dispatch loop, embedding API entries, and the explicit
//! [`Vm::collect_garbage`] call.

use crate::vm::Vm;
use ember_core::{ObjRef, SYM_DTOR, Value};

impl Vm {
    /// Force a full mark/sweep/finalize cycle. No-op while a collection is
    /// already running.
    pub fn collect_garbage(&mut self) {
        if self.heap.gc_running() {
            return;
        }
        self.heap.begin_gc();
        let bytes_before = self.heap.bytes_allocated();

        let roots = self.gather_roots();
        self.heap.mark_from(roots);
        // Finalization candidates are re-marked with their whole subgraph:
        // the dtor below still needs their class chain and fields, so the
        // sweep must not take them this cycle.
        let scheduled = self.heap.schedule_finalizers();
        let scheduled_count = scheduled.len();
        self.finalize_queue.extend(scheduled);
        let swept = self.heap.sweep();

        // Script dtors, best effort. `gc_running` stays set so allocation
        // inside a dtor cannot request a nested collection. Finalized
        // objects are taken by the next sweep.
        let queue = std::mem::take(&mut self.finalize_queue);
        for obj in queue {
            self.run_dtor(obj);
            self.heap.set_finalized(obj);
        }

        self.heap.end_gc();
        tracing::debug!(
            bytes_before,
            bytes_after = self.heap.bytes_allocated(),
            freed_objects = swept.freed_objects,
            scheduled = scheduled_count,
            "gc: cycle complete"
        );
    }

    fn gather_roots(&self) -> Vec<ObjRef> {
        let mut roots: Vec<ObjRef> = Vec::new();
        let mut push = |roots: &mut Vec<ObjRef>, v: Value| {
            if let Some(r) = v.object_ref() {
                roots.push(r);
            }
        };

        // 1. Every value on the operand stack up to stack_top.
        for v in &self.stack[..self.stack_top.min(self.stack.len())] {
            push(&mut roots, *v);
        }
        // 2. Every function on the call-frame stack.
        for frame in &self.frames {
            if let Some(f) = frame.func {
                roots.push(f);
            }
        }
        if let Some(n) = self.current_native {
            roots.push(n);
        }
        // 3. Every module in the registry.
        roots.extend(self.modules.values().copied());
        // 4. Every live handle.
        for v in self.handles.iter().flatten() {
            push(&mut roots, *v);
        }
        // 5. The temp-root stack (covers compiles in flight: the module
        //    under construction pins everything the builders reference).
        for v in self.heap.temp_roots() {
            push(&mut roots, *v);
        }
        // 6. Objects awaiting their script dtor.
        roots.extend(self.finalize_queue.iter().copied());
        roots
    }

    /// Invoke `dtor` on a dying instance or reference. Failures are
    /// swallowed: the object is going away regardless.
    fn run_dtor(&mut self, obj: ObjRef) {
        let class = match self.heap.obj(obj) {
            crate::object::Obj::Instance(i) => Some(i.class),
            crate::object::Obj::Reference(r) => r.class,
            _ => None,
        };
        let Some(class) = class else { return };
        let dtor = self.heap.chain_symbol(class, SYM_DTOR);
        if dtor.is_nil() {
            return;
        }
        if let Err(e) = self.call_detached(dtor, &[Value::object(obj)]) {
            tracing::debug!("gc: dtor raised '{}', ignored", e.message);
        }
    }
}
