//! The register-based interpreter.
//!
//! A VM owns the heap, the symbol table, the module registry, the operand
//! stack and the call-frame stack. The operand stack is addressed by
//! frame-relative register indices; growing it preserves every logical
//! offset because frames store bases as indices, not pointers.
//!
//! Calls come in four shapes, all dispatched through [`Vm::begin_call`]:
//! script functions push a frame and the dispatch loop keeps going; native
//! functions run to completion inside a native frame; an instance (or
//! reference) with a `call` method gets the receiver shifted in as
//! argument 0; and a class as callee is the construction call emitted by
//! `new`, resolving `ctor` up the base chain.
//!
//! Runtime errors unwind to the entry frame of the innermost host call,
//! emitting a synthetic stack trace through the host error hook, and leave
//! the VM reusable: the operand stack is truncated to the entry frame's
//! saved top.

use std::collections::HashMap;

use crate::config::VmParams;
use crate::error::{ErrorCode, VmError};
use crate::heap::Heap;
use crate::object::{Obj, ObjFn, ObjInstance};
use ember_core::{Instr, ObjRef, OpCode, SYM_CALL, SYM_CTOR, SymbolTable, Value};

/// Hard ceiling on call depth; recursion beyond this raises a runtime
/// error instead of exhausting the host stack.
const MAX_FRAMES: usize = 4096;

/// Ceiling on callee re-dispatch (instance `call` methods that are
/// themselves callable objects).
const MAX_CALL_HOPS: usize = 8;

/// One activation record. `func` is `None` for native frames, which exist
/// only for the duration of the native call.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Frame {
    pub func: Option<ObjRef>,
    pub ip: usize,
    /// Index of register 0 within the operand stack.
    pub base: usize,
    /// `stack_top` to restore when this frame pops.
    pub saved_top: usize,
}

enum Flow {
    Continue,
    Return,
}

/// A single-threaded Ember virtual machine.
pub struct Vm {
    pub(crate) heap: Heap,
    pub(crate) symbols: SymbolTable,
    pub(crate) modules: HashMap<String, ObjRef>,
    pub(crate) stack: Vec<Value>,
    pub(crate) stack_top: usize,
    pub(crate) frames: Vec<Frame>,
    pub(crate) handles: Vec<Option<Value>>,
    pub(crate) free_handles: Vec<u32>,
    pub(crate) current_native: Option<ObjRef>,
    pub(crate) finalize_queue: Vec<ObjRef>,
    pub(crate) host: Box<dyn crate::config::Host>,
    pub(crate) last_error: String,
}

impl Vm {
    pub fn new(params: VmParams) -> Self {
        Vm {
            heap: Heap::new(
                params.min_heap_size,
                params.initial_heap_size,
                params.heap_growth_factor,
            ),
            symbols: SymbolTable::new(),
            modules: HashMap::new(),
            stack: Vec::new(),
            stack_top: 0,
            frames: Vec::new(),
            handles: Vec::new(),
            free_handles: Vec::new(),
            current_native: None,
            finalize_queue: Vec::new(),
            host: params.host,
            last_error: String::new(),
        }
    }

    /// The message of the most recent runtime or compile error.
    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    /// Mutable access to the host hooks (natives use this to reach their
    /// embedder's state).
    pub fn host_mut(&mut self) -> &mut dyn crate::config::Host {
        &mut *self.host
    }

    // =========================================================================
    // Small shared plumbing
    // =========================================================================

    pub(crate) fn maybe_collect(&mut self) {
        if self.heap.gc_pending() {
            self.collect_garbage();
        }
    }

    pub(crate) fn ensure_stack(&mut self, len: usize) {
        if self.stack.len() < len {
            self.stack.resize(len, Value::NIL);
        }
    }

    #[inline]
    fn reg(&self, base: usize, i: u16) -> Value {
        self.stack[base + i as usize]
    }

    #[inline]
    fn set_reg(&mut self, base: usize, i: u16, v: Value) {
        self.stack[base + i as usize] = v;
    }

    /// The heap function behind a frame's `func` field.
    pub(crate) fn function(&self, r: ObjRef) -> &ObjFn {
        match self.heap.obj(r) {
            Obj::Fn(f) => f,
            _ => unreachable!("frame function is not a function object"),
        }
    }

    fn current_line(&self) -> u32 {
        match self.frames.last() {
            Some(Frame {
                func: Some(r), ip, ..
            }) => self.function(*r).line_at(ip.saturating_sub(1)),
            _ => 0,
        }
    }

    /// Build a line-stamped error at the current instruction. Native
    /// functions use this to fail a call with script-level context.
    pub fn error(&self, code: ErrorCode, message: impl Into<String>) -> VmError {
        VmError::new(code, self.current_line(), message)
    }

    fn is_string(&self, v: Value) -> bool {
        matches!(v.object_ref().map(|r| self.heap.obj(r)), Some(Obj::Str(_)))
    }

    fn class_chain_names(&self, class: ObjRef) -> String {
        let mut names = Vec::new();
        let mut cur = Some(class);
        while let Some(r) = cur {
            let Obj::Class(c) = self.heap.obj(r) else { break };
            names.push(c.name.clone());
            cur = c.base;
        }
        names.join(" -> ")
    }

    fn missing_symbol(&self, class: ObjRef, sym: u32) -> VmError {
        let name = self.symbols.name(sym).unwrap_or("?");
        self.error(
            ErrorCode::Runtime,
            format!(
                "undefined symbol '{name}' on class {}",
                self.class_chain_names(class)
            ),
        )
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// Run `callee` with `argc` arguments already sitting at
    /// `stack[base..base+argc]`. Returns the result (which also lands in
    /// `stack[base]`). Unwinds on error and leaves the VM reusable.
    pub(crate) fn call_value(
        &mut self,
        callee: Value,
        base: usize,
        argc: usize,
    ) -> Result<Value, VmError> {
        self.maybe_collect();
        let entry_depth = self.frames.len();
        if let Err(e) = self.begin_call(callee, base, argc) {
            self.unwind(entry_depth, &e);
            return Err(e);
        }
        if self.frames.len() > entry_depth {
            self.run(entry_depth)?;
        }
        Ok(self.stack[base])
    }

    /// Call with arguments copied to a scratch region above `stack_top`;
    /// used by the embedding API and the collector's `dtor` dispatch.
    pub(crate) fn call_detached(
        &mut self,
        callee: Value,
        args: &[Value],
    ) -> Result<Value, VmError> {
        let base = self.stack_top;
        self.ensure_stack(base + args.len().max(1));
        for (i, a) in args.iter().enumerate() {
            self.stack[base + i] = *a;
        }
        let saved_top = self.stack_top;
        self.stack_top = base + args.len();
        let result = self.call_value(callee, base, args.len());
        self.stack_top = saved_top;
        result
    }

    /// Dispatch a call: push a script frame, run a native to completion,
    /// or re-route through `call`/`ctor` for instances and classes.
    pub(crate) fn begin_call(
        &mut self,
        callee: Value,
        base: usize,
        argc: usize,
    ) -> Result<(), VmError> {
        // What to do with a callee, probed with a short immutable borrow so
        // the acting code below is free to mutate the VM.
        enum Target {
            Script { arity: i32, needed: usize },
            Native { func: crate::object::NativeFn, arity: i32 },
            /// Instance-like: dispatch the class chain's `call` method.
            Callable { class: Option<ObjRef> },
            /// Construction call emitted by `new`.
            Construct,
            NotCallable,
        }

        let mut callee = callee;
        let mut argc = argc;
        for _hop in 0..MAX_CALL_HOPS {
            let Some(r) = callee.object_ref() else {
                return Err(self.error(
                    ErrorCode::InvalidOpOnType,
                    format!("cannot call a {} value", self.heap.type_name(callee)),
                ));
            };
            let target = match self.heap.obj(r) {
                Obj::Fn(f) => Target::Script {
                    arity: f.arity,
                    needed: f.needed_stack,
                },
                Obj::NativeFn(n) => Target::Native {
                    func: n.func,
                    arity: n.arity,
                },
                Obj::Instance(i) => Target::Callable {
                    class: Some(i.class),
                },
                Obj::Reference(rf) => Target::Callable { class: rf.class },
                Obj::WeakRef(w) => Target::Callable { class: w.class },
                Obj::Class(_) => Target::Construct,
                Obj::Str(_) | Obj::Module(_) => Target::NotCallable,
            };

            match target {
                Target::Script { arity, needed } => {
                    if arity >= 0 && arity as usize != argc {
                        let msg = format!(
                            "function '{}' expects {arity} arguments, got {argc}",
                            self.callee_name(r)
                        );
                        return Err(self.error(ErrorCode::FnArityMismatch, msg));
                    }
                    return self.push_script_frame(r, base, argc, needed);
                }
                Target::Native { func, arity } => {
                    if arity >= 0 && arity as usize != argc {
                        let msg = format!(
                            "native '{}' expects {arity} arguments, got {argc}",
                            self.callee_name(r)
                        );
                        return Err(self.error(ErrorCode::FnArityMismatch, msg));
                    }
                    return self.run_native(r, func, base, argc);
                }
                Target::Callable { class } => {
                    let method = match class {
                        Some(c) => self.heap.chain_symbol(c, SYM_CALL),
                        None => Value::NIL,
                    };
                    if method.is_nil() {
                        return Err(self.error(
                            ErrorCode::InvalidOpOnType,
                            format!("{} is not callable", self.heap.format_value(callee)),
                        ));
                    }
                    // Prepend the receiver, shifting the arguments up one.
                    self.ensure_stack(base + argc + 1);
                    for i in (0..argc).rev() {
                        self.stack[base + 1 + i] = self.stack[base + i];
                    }
                    self.stack[base] = callee;
                    if self.stack_top < base + argc + 1 {
                        self.stack_top = base + argc + 1;
                    }
                    callee = method;
                    argc += 1;
                }
                Target::Construct => {
                    // The fresh instance is already argument 0.
                    let ctor = self.heap.chain_symbol(r, SYM_CTOR);
                    if ctor.is_nil() {
                        if argc > 1 {
                            let msg = format!(
                                "class '{}' has no ctor but was given {} arguments",
                                self.callee_name(r),
                                argc - 1
                            );
                            return Err(self.error(ErrorCode::FnArityMismatch, msg));
                        }
                        if argc == 0 {
                            self.ensure_stack(base + 1);
                            self.stack[base] = Value::NIL;
                        }
                        return Ok(());
                    }
                    callee = ctor;
                }
                Target::NotCallable => {
                    return Err(self.error(
                        ErrorCode::InvalidOpOnType,
                        format!("cannot call a {} value", self.heap.type_name(callee)),
                    ));
                }
            }
        }
        Err(self.error(ErrorCode::Runtime, "call dispatch did not settle"))
    }

    fn callee_name(&self, r: ObjRef) -> String {
        match self.heap.obj(r) {
            Obj::Fn(f) => f.name.clone(),
            Obj::NativeFn(n) => n.name.clone(),
            Obj::Class(c) => c.name.clone(),
            _ => "?".to_string(),
        }
    }

    fn push_script_frame(
        &mut self,
        func: ObjRef,
        base: usize,
        argc: usize,
        needed: usize,
    ) -> Result<(), VmError> {
        if self.frames.len() >= MAX_FRAMES {
            return Err(self.error(ErrorCode::Runtime, "call stack overflow"));
        }
        self.ensure_stack(base + needed);
        // Clear the register window above the arguments so stale values
        // from earlier frames neither leak into reads nor pin dead objects.
        for i in base + argc..base + needed {
            self.stack[i] = Value::NIL;
        }
        self.frames.push(Frame {
            func: Some(func),
            ip: 0,
            base,
            saved_top: self.stack_top,
        });
        self.stack_top = base + needed;
        Ok(())
    }

    fn run_native(
        &mut self,
        native: ObjRef,
        func: crate::object::NativeFn,
        base: usize,
        argc: usize,
    ) -> Result<(), VmError> {
        if self.frames.len() >= MAX_FRAMES {
            return Err(self.error(ErrorCode::Runtime, "call stack overflow"));
        }
        self.ensure_stack(base + argc.max(1));
        if argc == 0 {
            // Slot 0 doubles as the return slot; give it a defined value.
            self.stack[base] = Value::NIL;
        }
        self.frames.push(Frame {
            func: None,
            ip: 0,
            base,
            saved_top: self.stack_top,
        });
        self.stack_top = base + argc;
        let prev = self.current_native.replace(native);
        let result = func(self);
        self.current_native = prev;
        match result {
            Ok(()) => {
                if let Some(frame) = self.frames.pop() {
                    self.stack_top = frame.saved_top;
                }
                Ok(())
            }
            // Leave the native frame in place: the unwinder pops it and
            // reports it in the stack trace.
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // The dispatch loop
    // =========================================================================

    /// Interpret until the frame stack returns to `entry_depth`. On error,
    /// unwind (emitting the stack trace) and propagate.
    pub(crate) fn run(&mut self, entry_depth: usize) -> Result<(), VmError> {
        loop {
            if self.heap.gc_pending() {
                self.collect_garbage();
            }
            let Some(frame) = self.frames.last() else {
                return Ok(());
            };
            let (func, ip, base) = (frame.func, frame.ip, frame.base);
            let Some(func) = func else {
                // Native frames never reach the dispatch loop.
                let e = self.error(ErrorCode::Runtime, "dispatch reached a native frame");
                self.unwind(entry_depth, &e);
                return Err(e);
            };
            let fetched = {
                let f = self.function(func);
                f.code.get(ip).copied()
            };
            let Some(instr) = fetched else {
                let e = self.error(ErrorCode::Runtime, "instruction pointer out of range");
                self.unwind(entry_depth, &e);
                return Err(e);
            };
            if let Some(frame) = self.frames.last_mut() {
                frame.ip = ip + 1;
            }
            match self.step(instr, func, base, entry_depth) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Return) => return Ok(()),
                Err(e) => {
                    self.unwind(entry_depth, &e);
                    return Err(e);
                }
            }
        }
    }

    fn step(
        &mut self,
        instr: Instr,
        func: ObjRef,
        base: usize,
        entry_depth: usize,
    ) -> Result<Flow, VmError> {
        let Some(op) = instr.op() else {
            return Err(self.error(ErrorCode::Runtime, "invalid instruction word"));
        };
        match op {
            OpCode::LoadBasic => {
                let v = match instr.bx() {
                    0 => Value::TRUE,
                    1 => Value::FALSE,
                    2 => Value::NIL,
                    3 => Value::object(self.function(func).module),
                    bx => {
                        let idx = (bx - 4) as usize;
                        match self.function(func).constants.get(idx) {
                            Some(v) => *v,
                            None => {
                                return Err(self
                                    .error(ErrorCode::Runtime, "constant index out of range"));
                            }
                        }
                    }
                };
                self.set_reg(base, instr.a(), v);
            }
            OpCode::StoreMove => {
                let v = self.stack[base + instr.bx() as usize];
                self.set_reg(base, instr.a(), v);
            }
            OpCode::LoadSymbol => {
                let target = self.reg(base, instr.b());
                let v = self.load_symbol(target, u32::from(instr.c()))?;
                self.set_reg(base, instr.a(), v);
            }
            OpCode::StoreSymbol => {
                let target = self.reg(base, instr.a());
                let v = self.reg(base, instr.c());
                self.store_symbol(target, u32::from(instr.b()), v)?;
            }
            OpCode::NewClz => {
                let cls_val = self.stack[base + instr.bx() as usize];
                let inst = self.instantiate(cls_val)?;
                self.set_reg(base, instr.a(), inst);
            }
            OpCode::Add => {
                let l = self.reg(base, instr.b());
                let r = self.reg(base, instr.c());
                let v = if l.is_number() && r.is_number() {
                    Value::number(l.as_number() + r.as_number())
                } else if self.is_string(l) || self.is_string(r) {
                    let text =
                        format!("{}{}", self.heap.format_value(l), self.heap.format_value(r));
                    self.heap.new_string(text)
                } else {
                    return Err(self.op_type_error("+", l, r));
                };
                self.set_reg(base, instr.a(), v);
            }
            OpCode::Sub => self.arith(instr, base, "-", |x, y| x - y)?,
            OpCode::Mul => self.arith(instr, base, "*", |x, y| x * y)?,
            OpCode::Div => self.arith(instr, base, "/", |x, y| x / y)?,
            OpCode::Mod => self.arith(instr, base, "%", |x, y| x % y)?,
            OpCode::Pow => self.arith(instr, base, "**", f64::powf)?,
            OpCode::Neg => {
                let v = self.stack[base + instr.bx() as usize];
                if !v.is_number() {
                    return Err(self.error(
                        ErrorCode::InvalidOpOnType,
                        format!("cannot negate a {} value", self.heap.type_name(v)),
                    ));
                }
                self.set_reg(base, instr.a(), Value::number(-v.as_number()));
            }
            OpCode::CmpEq | OpCode::CmpNe => {
                let l = self.reg(base, instr.b());
                let r = self.reg(base, instr.c());
                let eq = self.heap.values_equal(l, r);
                let v = Value::boolean(if op == OpCode::CmpEq { eq } else { !eq });
                self.set_reg(base, instr.a(), v);
            }
            OpCode::CmpLt | OpCode::CmpLe | OpCode::CmpGt | OpCode::CmpGe => {
                let l = self.reg(base, instr.b());
                let r = self.reg(base, instr.c());
                let v = Value::boolean(compare(op, l, r));
                self.set_reg(base, instr.a(), v);
            }
            OpCode::And => {
                let l = self.reg(base, instr.b()).is_truthy();
                let r = self.reg(base, instr.c()).is_truthy();
                self.set_reg(base, instr.a(), Value::boolean(l && r));
            }
            OpCode::Or => {
                let l = self.reg(base, instr.b()).is_truthy();
                let r = self.reg(base, instr.c()).is_truthy();
                self.set_reg(base, instr.a(), Value::boolean(l || r));
            }
            OpCode::Not => {
                let v = self.stack[base + instr.bx() as usize];
                self.set_reg(base, instr.a(), Value::boolean(!v.is_truthy()));
            }
            OpCode::Call => {
                let callee = self.reg(base, instr.b());
                let call_base = base + instr.a() as usize;
                self.begin_call(callee, call_base, instr.c() as usize)?;
            }
            OpCode::Jump => self.offset_ip(instr.sbx())?,
            OpCode::JumpIf => {
                if self.reg(base, instr.a()).is_truthy() {
                    self.offset_ip(instr.sbx())?;
                }
            }
            OpCode::JumpIfNot => {
                if !self.reg(base, instr.a()).is_truthy() {
                    self.offset_ip(instr.sbx())?;
                }
            }
            OpCode::Return => {
                let result = self.stack[base + instr.bx() as usize];
                let Some(frame) = self.frames.pop() else {
                    return Err(self.error(ErrorCode::Runtime, "return without a frame"));
                };
                self.stack[frame.base] = result;
                self.stack_top = frame.saved_top;
                if self.frames.len() == entry_depth {
                    return Ok(Flow::Return);
                }
            }
        }
        Ok(Flow::Continue)
    }

    fn arith(
        &mut self,
        instr: Instr,
        base: usize,
        sym: &str,
        f: impl Fn(f64, f64) -> f64,
    ) -> Result<(), VmError> {
        let l = self.reg(base, instr.b());
        let r = self.reg(base, instr.c());
        if l.is_number() && r.is_number() {
            self.set_reg(base, instr.a(), Value::number(f(l.as_number(), r.as_number())));
            Ok(())
        } else {
            Err(self.op_type_error(sym, l, r))
        }
    }

    fn op_type_error(&self, sym: &str, l: Value, r: Value) -> VmError {
        self.error(
            ErrorCode::InvalidOpOnType,
            format!(
                "operands of '{sym}' must be numbers, got {} and {}",
                self.heap.type_name(l),
                self.heap.type_name(r)
            ),
        )
    }

    fn offset_ip(&mut self, sbx: i32) -> Result<(), VmError> {
        let Some(frame) = self.frames.last_mut() else {
            return Ok(());
        };
        let target = frame.ip as i64 + i64::from(sbx);
        if target < 0 {
            return Err(self.error(ErrorCode::Runtime, "jump target out of range"));
        }
        if let Some(frame) = self.frames.last_mut() {
            frame.ip = target as usize;
        }
        Ok(())
    }

    // =========================================================================
    // Symbol resolution
    // =========================================================================

    /// `LoadSymbol`: instance fields, then the class chain (first non-nil
    /// entry), then module variables.
    pub(crate) fn load_symbol(&self, target: Value, sym: u32) -> Result<Value, VmError> {
        let Some(r) = target.object_ref() else {
            return Err(self.error(
                ErrorCode::InvalidOpOnType,
                format!("a {} value has no members", self.heap.type_name(target)),
            ));
        };
        let class = match self.heap.obj(r) {
            Obj::Instance(inst) => {
                if let Some(v) = inst.fields.get(&sym) {
                    return Ok(*v);
                }
                Some(inst.class)
            }
            Obj::Class(_) => Some(r),
            Obj::Reference(rf) => rf.class,
            Obj::WeakRef(w) => w.class,
            Obj::Module(m) => {
                return m.get(sym).ok_or_else(|| {
                    let name = self.symbols.name(sym).unwrap_or("?");
                    self.error(
                        ErrorCode::Runtime,
                        format!("module '{}' has no variable '{name}'", m.name),
                    )
                });
            }
            Obj::Str(_) | Obj::Fn(_) | Obj::NativeFn(_) => {
                return Err(self.error(
                    ErrorCode::InvalidOpOnType,
                    format!("a {} value has no members", self.heap.type_name(target)),
                ));
            }
        };
        let Some(class) = class else {
            return Err(self.error(ErrorCode::Runtime, "reference has no class"));
        };
        let v = self.heap.chain_symbol(class, sym);
        if v.is_nil() {
            Err(self.missing_symbol(class, sym))
        } else {
            Ok(v)
        }
    }

    fn store_symbol(&mut self, target: Value, sym: u32, v: Value) -> Result<(), VmError> {
        let Some(r) = target.object_ref() else {
            return Err(self.error(ErrorCode::InvalidOpOnType, "invalid store target"));
        };
        match self.heap.obj_mut(r) {
            Obj::Instance(inst) => {
                inst.fields.insert(sym, v);
                Ok(())
            }
            Obj::Module(m) => {
                m.set(sym, v);
                Ok(())
            }
            Obj::Class(c) => {
                c.set_symbol(sym, v);
                Ok(())
            }
            _ => Err(self.error(ErrorCode::InvalidOpOnType, "invalid store target")),
        }
    }

    /// `NewClz`: allocate an instance with its class's declared fields.
    fn instantiate(&mut self, cls_val: Value) -> Result<Value, VmError> {
        let Some(cr) = cls_val.object_ref() else {
            return Err(self.error(
                ErrorCode::InvalidOpOnType,
                format!("'new' needs a class, got a {}", self.heap.type_name(cls_val)),
            ));
        };
        let (fields, extra_size) = match self.heap.obj(cr) {
            Obj::Class(c) => (
                c.field_inits.iter().copied().collect::<HashMap<u32, Value>>(),
                c.extra_size,
            ),
            _ => {
                return Err(self.error(
                    ErrorCode::InvalidOpOnType,
                    format!("'new' needs a class, got a {}", self.heap.type_name(cls_val)),
                ));
            }
        };
        let inst = self.heap.alloc(Obj::Instance(ObjInstance {
            class: cr,
            fields,
            extra: vec![0u8; extra_size].into_boxed_slice(),
        }));
        Ok(Value::object(inst))
    }

    // =========================================================================
    // Unwinding
    // =========================================================================

    /// Pop frames down to `entry_depth`, reporting the error and a
    /// synthetic stack trace through the host hook, and truncate the
    /// operand stack to the entry frame's saved top.
    pub(crate) fn unwind(&mut self, entry_depth: usize, err: &VmError) {
        self.last_error = err.message.clone();
        tracing::debug!(code = ?err.code, line = err.line, "vm: unwinding: {}", err.message);
        let context = match self.frames.last().and_then(|f| f.func) {
            Some(r) => self.function(r).name.clone(),
            None => String::new(),
        };
        self.host.error(err.code, &context, err.line, &err.message);
        self.host
            .error(ErrorCode::StackTraceBegin, "", 0, "stack trace");
        while self.frames.len() > entry_depth {
            let idx = self.frames.len() - 1;
            let Some(frame) = self.frames.pop() else { break };
            let (line, name) = match frame.func {
                Some(r) => {
                    let f = self.function(r);
                    (f.line_at(frame.ip.saturating_sub(1)), f.name.clone())
                }
                None => (0, "<native>".to_string()),
            };
            let msg = format!("frame {idx}, line {line}, in {name}");
            self.host.error(ErrorCode::StackTraceFrame, &name, line, &msg);
            self.stack_top = frame.saved_top;
        }
        self.host.error(ErrorCode::StackTraceEnd, "", 0, "");
    }
}

/// Ordering comparisons: IEEE for two numbers, raw 64-bit pattern order
/// for every other pairing (matching the source runtime's fallthrough).
fn compare(op: OpCode, l: Value, r: Value) -> bool {
    if l.is_number() && r.is_number() {
        let (x, y) = (l.as_number(), r.as_number());
        match op {
            OpCode::CmpLt => x < y,
            OpCode::CmpLe => x <= y,
            OpCode::CmpGt => x > y,
            OpCode::CmpGe => x >= y,
            _ => false,
        }
    } else {
        let ord = l.raw_cmp(r);
        match op {
            OpCode::CmpLt => ord.is_lt(),
            OpCode::CmpLe => ord.is_le(),
            OpCode::CmpGt => ord.is_gt(),
            OpCode::CmpGe => ord.is_ge(),
            _ => false,
        }
    }
}
