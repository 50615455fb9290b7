//! The arena heap and the mark/sweep machinery.
//!
//! One heap exists per VM. It is a slot vector plus a free list: an
//! [`ObjRef`] is a slot index, and the slot vector doubles as the
//! all-objects list the collector walks. Allocation never blocks for a
//! collection — when `bytes_allocated` crosses the threshold the heap
//! raises `gc_pending`, and the VM collects at its next safe point
//! (dispatch boundary or API entry). `gc_running` suppresses both the
//! pending flag and re-entrant collection while finalizers execute.
//!
//! The temp-root stack pins objects over the short window between
//! allocating them and linking them into something reachable (a module
//! under compilation, for instance). It is strictly LIFO.
//!
//! Object lifecycle around finalization: a dead instance whose class chain
//! carries a script `dtor` is moved to `Phase::Scheduled` and queued
//! instead of freed; once its `dtor` has run it becomes `Phase::Finalized`
//! and the next sweep frees it without running anything again.

use crate::object::{NativeFinalizer, Obj};
use ember_core::{ObjRef, SYM_DTOR, Value, value};

/// Slots reserved for the temp-root stack; pushes beyond this are a logic
/// error upstream (the windows are short and LIFO).
const TEMP_ROOT_CAPACITY: usize = 16;

/// Finalization state of a live slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Ordinary object.
    Live,
    /// Unreachable, native finalizer already run, waiting for its script
    /// `dtor` in the finalization queue.
    Scheduled,
    /// Finalizers done; the next sweep frees it unconditionally.
    Finalized,
}

#[derive(Debug)]
struct HeapSlot {
    obj: Obj,
    marked: bool,
    phase: Phase,
    /// Footprint recorded at allocation, subtracted verbatim at free.
    size: usize,
}

/// What one sweep did, for logging and the collector's bookkeeping.
#[derive(Debug, Default)]
pub(crate) struct SweepResult {
    pub freed_objects: usize,
    pub freed_bytes: usize,
}

#[derive(Debug)]
pub struct Heap {
    slots: Vec<Option<HeapSlot>>,
    free: Vec<u32>,
    bytes_allocated: usize,
    next_gc: usize,
    min_heap: usize,
    growth_factor: f64,
    gc_pending: bool,
    gc_running: bool,
    temp_roots: Vec<Value>,
}

impl Heap {
    pub fn new(min_heap: usize, initial_heap: usize, growth_factor: f64) -> Self {
        Heap {
            slots: Vec::new(),
            free: Vec::new(),
            bytes_allocated: 0,
            next_gc: initial_heap.max(min_heap),
            min_heap,
            growth_factor,
            gc_pending: false,
            gc_running: false,
            temp_roots: Vec::with_capacity(TEMP_ROOT_CAPACITY),
        }
    }

    // =========================================================================
    // Allocation and access
    // =========================================================================

    pub fn alloc(&mut self, obj: Obj) -> ObjRef {
        let size = obj.approx_size();
        self.bytes_allocated += size;
        if self.bytes_allocated >= self.next_gc && !self.gc_running {
            self.gc_pending = true;
        }
        let slot = HeapSlot {
            obj,
            marked: false,
            phase: Phase::Live,
            size,
        };
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize] = Some(slot);
                ObjRef(idx)
            }
            None => {
                self.slots.push(Some(slot));
                ObjRef((self.slots.len() - 1) as u32)
            }
        }
    }

    /// Allocate a script string value.
    pub fn new_string(&mut self, text: String) -> Value {
        let r = self.alloc(Obj::Str(crate::object::ObjStr::new(text)));
        Value::object(r)
    }

    pub fn obj(&self, r: ObjRef) -> &Obj {
        match self.slots.get(r.0 as usize) {
            Some(Some(slot)) => &slot.obj,
            _ => unreachable_stale(r),
        }
    }

    pub fn obj_mut(&mut self, r: ObjRef) -> &mut Obj {
        match self.slots.get_mut(r.0 as usize) {
            Some(Some(slot)) => &mut slot.obj,
            _ => unreachable_stale(r),
        }
    }

    /// True while `r` names an allocated slot.
    pub fn contains(&self, r: ObjRef) -> bool {
        matches!(self.slots.get(r.0 as usize), Some(Some(_)))
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn object_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    // =========================================================================
    // GC control state
    // =========================================================================

    pub fn gc_pending(&self) -> bool {
        self.gc_pending
    }

    pub fn gc_running(&self) -> bool {
        self.gc_running
    }

    pub(crate) fn begin_gc(&mut self) {
        self.gc_running = true;
        self.gc_pending = false;
    }

    pub(crate) fn end_gc(&mut self) {
        let grown = (self.bytes_allocated as f64 * (1.0 + self.growth_factor)) as usize;
        self.next_gc = grown.max(self.min_heap);
        self.gc_running = false;
    }

    pub(crate) fn set_finalized(&mut self, r: ObjRef) {
        if let Some(Some(slot)) = self.slots.get_mut(r.0 as usize) {
            slot.phase = Phase::Finalized;
        }
    }

    // =========================================================================
    // Temp roots
    // =========================================================================

    /// Pin a value against collection. Pair with [`pop_temp_root`] in LIFO
    /// order.
    ///
    /// [`pop_temp_root`]: Heap::pop_temp_root
    pub fn push_temp_root(&mut self, v: Value) {
        debug_assert!(self.temp_roots.len() < TEMP_ROOT_CAPACITY);
        self.temp_roots.push(v);
    }

    pub fn pop_temp_root(&mut self) -> Option<Value> {
        self.temp_roots.pop()
    }

    pub(crate) fn temp_roots(&self) -> &[Value] {
        &self.temp_roots
    }

    // =========================================================================
    // Mark
    // =========================================================================

    /// Mark everything reachable from `roots` (iteratively; object graphs
    /// are cyclic and arbitrarily deep).
    pub(crate) fn mark_from(&mut self, roots: impl IntoIterator<Item = ObjRef>) {
        let mut work: Vec<ObjRef> = roots.into_iter().filter(|r| self.contains(*r)).collect();
        while let Some(r) = work.pop() {
            {
                let slot = match self.slots.get_mut(r.0 as usize) {
                    Some(Some(slot)) => slot,
                    _ => continue,
                };
                if slot.marked {
                    continue;
                }
                slot.marked = true;
            }
            self.push_children(r, &mut work);
        }
    }

    fn push_children(&self, r: ObjRef, work: &mut Vec<ObjRef>) {
        let mut push_value = |work: &mut Vec<ObjRef>, v: Value| {
            if let Some(child) = v.object_ref() {
                work.push(child);
            }
        };
        match self.obj(r) {
            Obj::Str(_) => {}
            Obj::Module(m) => {
                for (_, v) in m.declared() {
                    push_value(work, v);
                }
                if let Some(init) = m.init_fn {
                    work.push(init);
                }
            }
            Obj::Class(c) => {
                if let Some(base) = c.base {
                    work.push(base);
                }
                if let Some(module) = c.module {
                    work.push(module);
                }
                for v in &c.symbols {
                    push_value(work, *v);
                }
                for (_, v) in &c.field_inits {
                    push_value(work, *v);
                }
            }
            Obj::Instance(i) => {
                work.push(i.class);
                for v in i.fields.values() {
                    push_value(work, *v);
                }
            }
            Obj::Fn(f) => {
                work.push(f.module);
                for v in &f.constants {
                    push_value(work, *v);
                }
            }
            Obj::NativeFn(n) => {
                for v in &n.statics {
                    push_value(work, *v);
                }
            }
            // The referenced host memory is never traced.
            Obj::Reference(rf) => {
                if let Some(class) = rf.class {
                    work.push(class);
                }
            }
            Obj::WeakRef(w) => {
                if let Some(class) = w.class {
                    work.push(class);
                }
            }
        }
    }

    // =========================================================================
    // Sweep
    // =========================================================================

    /// Post-mark, pre-sweep finalization pass.
    ///
    /// Every unmarked, never-finalized instance or reference whose class
    /// chain carries a native finalizer or a script `dtor` gets its native
    /// finalizer run here. Objects with a `dtor` are switched to
    /// `Phase::Scheduled`, re-marked together with everything they can
    /// reach (the `dtor` still needs their class chain and fields alive
    /// through the sweep), and returned for the collector to queue.
    /// Finalizer-only objects become `Phase::Finalized` and fall to the
    /// sweep.
    pub(crate) fn schedule_finalizers(&mut self) -> Vec<ObjRef> {
        struct Candidate {
            idx: usize,
            finalizer: Option<NativeFinalizer>,
            has_dtor: bool,
        }

        let mut candidates: Vec<Candidate> = Vec::new();
        for (idx, entry) in self.slots.iter().enumerate() {
            let Some(slot) = entry else { continue };
            if slot.marked || slot.phase != Phase::Live {
                continue;
            }
            let class = match &slot.obj {
                Obj::Instance(i) => Some(i.class),
                Obj::Reference(r) => r.class,
                _ => None,
            };
            let Some(class) = class else { continue };
            let finalizer = self.chain_finalizer(class);
            let has_dtor = !self.chain_symbol(class, SYM_DTOR).is_nil();
            if finalizer.is_some() || has_dtor {
                candidates.push(Candidate {
                    idx,
                    finalizer,
                    has_dtor,
                });
            }
        }

        let mut scheduled = Vec::new();
        for c in candidates {
            // An earlier candidate's re-marking may have made this one
            // reachable again (it sits in a dying peer's subgraph); its
            // turn comes in a later cycle.
            let still_dead = matches!(&self.slots[c.idx], Some(s) if !s.marked);
            if !still_dead {
                continue;
            }
            if let Some(fin) = c.finalizer {
                if let Some(slot) = self.slots[c.idx].as_mut() {
                    match &mut slot.obj {
                        Obj::Instance(i) => fin(&mut i.extra),
                        Obj::Reference(r) => fin(&mut r.extra),
                        _ => {}
                    }
                }
            }
            let r = ObjRef(c.idx as u32);
            if c.has_dtor {
                if let Some(slot) = self.slots[c.idx].as_mut() {
                    slot.phase = Phase::Scheduled;
                }
                self.mark_from([r]);
                scheduled.push(r);
            } else if let Some(slot) = self.slots[c.idx].as_mut() {
                // Native finalizer done; never run it again even if a peer
                // resurrects this object for a cycle.
                slot.phase = Phase::Finalized;
            }
        }
        scheduled
    }

    /// Free every unmarked slot and reset the marks of the survivors.
    pub(crate) fn sweep(&mut self) -> SweepResult {
        let mut result = SweepResult::default();
        for idx in 0..self.slots.len() {
            let marked = self.slots[idx].as_ref().map(|s| s.marked);
            match marked {
                None => {}
                Some(true) => {
                    if let Some(slot) = self.slots[idx].as_mut() {
                        slot.marked = false;
                    }
                }
                Some(false) => self.free_slot(idx, &mut result),
            }
        }
        result
    }

    fn free_slot(&mut self, idx: usize, result: &mut SweepResult) {
        if let Some(slot) = self.slots[idx].take() {
            self.bytes_allocated -= slot.size;
            result.freed_objects += 1;
            result.freed_bytes += slot.size;
            self.free.push(idx as u32);
        }
    }

    // =========================================================================
    // Class chain helpers
    // =========================================================================

    /// First non-nil `symbols[sym]` along the base-class chain.
    pub fn chain_symbol(&self, class: ObjRef, sym: u32) -> Value {
        let mut cur = Some(class);
        while let Some(r) = cur {
            let Obj::Class(c) = self.obj(r) else { break };
            let v = c.symbol(sym);
            if !v.is_nil() {
                return v;
            }
            cur = c.base;
        }
        Value::NIL
    }

    /// First native finalizer along the base-class chain.
    fn chain_finalizer(&self, class: ObjRef) -> Option<NativeFinalizer> {
        let mut cur = Some(class);
        while let Some(r) = cur {
            let Obj::Class(c) = self.obj(r) else { break };
            if c.finalizer.is_some() {
                return c.finalizer;
            }
            cur = c.base;
        }
        None
    }

    // =========================================================================
    // Value semantics that need object payloads
    // =========================================================================

    /// Full equality: bit/number equality, plus content equality for two
    /// strings (hash first, then bytes).
    pub fn values_equal(&self, a: Value, b: Value) -> bool {
        if a.same(b) {
            return true;
        }
        if let (Some(ra), Some(rb)) = (a.object_ref(), b.object_ref())
            && let (Obj::Str(sa), Obj::Str(sb)) = (self.obj(ra), self.obj(rb))
        {
            return sa.hash == sb.hash && sa.text == sb.text;
        }
        false
    }

    /// The display formatter scripts see: `print`, string concatenation
    /// and error messages all use it.
    pub fn format_value(&self, v: Value) -> String {
        if v.is_number() {
            return value::format_number(v.as_number());
        }
        if v.is_nil() {
            return "nil".to_string();
        }
        if v.is_bool() {
            return if v.as_bool() { "true" } else { "false" }.to_string();
        }
        match self.obj(v.as_object()) {
            Obj::Str(s) => s.text.clone(),
            Obj::Module(m) => format!("[module {}]", m.name),
            Obj::Class(c) => format!("[class {}]", c.name),
            Obj::Instance(i) => {
                let name = match self.obj(i.class) {
                    Obj::Class(c) => c.name.as_str(),
                    _ => "?",
                };
                format!("[instance of {name}]")
            }
            Obj::Fn(f) => format!("[func {}]", f.name),
            Obj::NativeFn(n) => format!("[native {}]", n.name),
            Obj::Reference(_) => "[reference]".to_string(),
            Obj::WeakRef(_) => "[weakref]".to_string(),
        }
    }

    /// The kind of value in `v`, for errors and the slot-type API.
    pub fn type_name(&self, v: Value) -> &'static str {
        if v.is_number() {
            "number"
        } else if v.is_nil() {
            "nil"
        } else if v.is_bool() {
            "bool"
        } else {
            match self.obj(v.as_object()) {
                Obj::Str(_) => "string",
                Obj::Module(_) => "module",
                Obj::Class(_) => "class",
                Obj::Instance(_) => "instance",
                Obj::Fn(_) => "function",
                Obj::NativeFn(_) => "native function",
                Obj::Reference(_) => "reference",
                Obj::WeakRef(_) => "weak reference",
            }
        }
    }
}

#[cold]
fn unreachable_stale(r: ObjRef) -> ! {
    // Reaching a freed slot means a root was missed; that is a VM bug, not
    // a recoverable script error.
    panic!("stale object reference #{}", r.0);
}
