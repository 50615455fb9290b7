//! The host-facing stack API.
//!
//! The host addresses the operand stack through small non-negative slot
//! indices. At top level the window starts at the stack base; inside a
//! native call it starts at the native frame's base, so slots `[0,
//! arg_count)` alias the script caller's argument registers and slot 0
//! doubles as the return slot.
//!
//! Handles are GC-safe references that survive across API calls: a slab
//! with a free pool, rooted until destroyed.

use crate::error::{ErrorCode, VmError};
use crate::object::{Obj, ObjReference, ObjWeakRef};
use crate::vm::Vm;
use ember_core::Value;

/// Host-visible classification of a slot's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Number,
    Bool,
    Nil,
    Str,
    Module,
    Class,
    Instance,
    Function,
    NativeFn,
    Reference,
    WeakRef,
}

/// A GC-safe reference to a value, valid until destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle(u32);

impl Vm {
    pub(crate) fn api_base(&self) -> usize {
        self.frames.last().map_or(0, |f| f.base)
    }

    fn slot_index(&self, slot: usize) -> usize {
        self.api_base() + slot
    }

    /// Grow (or shrink) the API window to `n` slots. New slots read nil.
    pub fn ensure_slots(&mut self, n: usize) {
        let base = self.api_base();
        let len = base + n;
        self.ensure_stack(len);
        if self.stack_top < len {
            for i in self.stack_top.max(base)..len {
                self.stack[i] = Value::NIL;
            }
        }
        self.stack_top = len;
    }

    /// Number of slots in the current window (argument count, inside a
    /// native call).
    pub fn slot_count(&self) -> usize {
        self.stack_top.saturating_sub(self.api_base())
    }

    pub(crate) fn slot_value(&self, slot: usize) -> Result<Value, VmError> {
        let idx = self.slot_index(slot);
        if idx >= self.stack_top || idx >= self.stack.len() {
            return Err(VmError::new(
                ErrorCode::InvalidArgument,
                0,
                format!("slot {slot} is outside the current window"),
            ));
        }
        Ok(self.stack[idx])
    }

    pub(crate) fn set_slot_value(&mut self, slot: usize, v: Value) {
        if slot >= self.slot_count() {
            self.ensure_slots(slot + 1);
        }
        let idx = self.slot_index(slot);
        self.stack[idx] = v;
    }

    // =========================================================================
    // Writers
    // =========================================================================

    pub fn set_slot_number(&mut self, slot: usize, n: f64) {
        self.set_slot_value(slot, Value::number(n));
    }

    pub fn set_slot_bool(&mut self, slot: usize, b: bool) {
        self.set_slot_value(slot, Value::boolean(b));
    }

    pub fn set_slot_nil(&mut self, slot: usize) {
        self.set_slot_value(slot, Value::NIL);
    }

    pub fn set_slot_string(&mut self, slot: usize, text: &str) {
        let v = self.heap.new_string(text.to_string());
        self.set_slot_value(slot, v);
    }

    /// Allocate a host-owned reference of `class_slot`'s class (extra-data
    /// bytes sized by the class binding) into `slot`.
    pub fn make_reference(&mut self, slot: usize, class_slot: usize) -> Result<(), VmError> {
        let cls = self.slot_value(class_slot)?;
        let (class, extra_size) = match cls.object_ref().map(|r| (r, self.heap.obj(r))) {
            Some((r, Obj::Class(c))) => (r, c.extra_size),
            _ => {
                return Err(VmError::new(
                    ErrorCode::InvalidArgument,
                    0,
                    "make_reference needs a class",
                ));
            }
        };
        let obj = self.heap.alloc(Obj::Reference(ObjReference {
            class: Some(class),
            extra: vec![0u8; extra_size].into_boxed_slice(),
        }));
        self.set_slot_value(slot, Value::object(obj));
        Ok(())
    }

    /// Wrap raw host memory in a weak reference. The pointer is never
    /// traced and never freed by the VM.
    pub fn make_weak_ref(
        &mut self,
        slot: usize,
        class_slot: Option<usize>,
        ptr: *mut u8,
    ) -> Result<(), VmError> {
        let class = match class_slot {
            Some(cs) => match self.slot_value(cs)?.object_ref() {
                Some(r) if matches!(self.heap.obj(r), Obj::Class(_)) => Some(r),
                _ => {
                    return Err(VmError::new(
                        ErrorCode::InvalidArgument,
                        0,
                        "make_weak_ref needs a class slot or None",
                    ));
                }
            },
            None => None,
        };
        let obj = self.heap.alloc(Obj::WeakRef(ObjWeakRef { class, ptr }));
        self.set_slot_value(slot, Value::object(obj));
        Ok(())
    }

    // =========================================================================
    // Readers
    // =========================================================================

    pub fn slot_type(&self, slot: usize) -> Result<ValueType, VmError> {
        let v = self.slot_value(slot)?;
        Ok(if v.is_number() {
            ValueType::Number
        } else if v.is_bool() {
            ValueType::Bool
        } else if v.is_nil() {
            ValueType::Nil
        } else {
            match self.heap.obj(v.as_object()) {
                Obj::Str(_) => ValueType::Str,
                Obj::Module(_) => ValueType::Module,
                Obj::Class(_) => ValueType::Class,
                Obj::Instance(_) => ValueType::Instance,
                Obj::Fn(_) => ValueType::Function,
                Obj::NativeFn(_) => ValueType::NativeFn,
                Obj::Reference(_) => ValueType::Reference,
                Obj::WeakRef(_) => ValueType::WeakRef,
            }
        })
    }

    pub fn slot_number(&self, slot: usize) -> Result<f64, VmError> {
        let v = self.slot_value(slot)?;
        if v.is_number() {
            Ok(v.as_number())
        } else {
            Err(self.wrong_type(slot, "number", v))
        }
    }

    pub fn slot_bool(&self, slot: usize) -> Result<bool, VmError> {
        let v = self.slot_value(slot)?;
        if v.is_bool() {
            Ok(v.as_bool())
        } else {
            Err(self.wrong_type(slot, "bool", v))
        }
    }

    pub fn slot_string(&self, slot: usize) -> Result<&str, VmError> {
        let v = self.slot_value(slot)?;
        match v.object_ref().map(|r| self.heap.obj(r)) {
            Some(Obj::Str(s)) => Ok(&s.text),
            _ => Err(self.wrong_type(slot, "string", v)),
        }
    }

    /// The extra-data bytes of the instance or reference in `slot`.
    pub fn slot_instance_data(&mut self, slot: usize) -> Result<&mut [u8], VmError> {
        let v = self.slot_value(slot)?;
        let Some(r) = v.object_ref() else {
            return Err(self.wrong_type(slot, "instance", v));
        };
        match self.heap.obj_mut(r) {
            Obj::Instance(i) => Ok(&mut i.extra),
            Obj::Reference(rf) => Ok(&mut rf.extra),
            _ => Err(VmError::new(
                ErrorCode::InvalidArgument,
                0,
                format!("slot {slot} holds no instance data"),
            )),
        }
    }

    /// Declared arity of the function or native in `slot` (−1 = variadic).
    pub fn slot_arity(&self, slot: usize) -> Result<i32, VmError> {
        let v = self.slot_value(slot)?;
        match v.object_ref().map(|r| self.heap.obj(r)) {
            Some(Obj::Fn(f)) => Ok(f.arity),
            Some(Obj::NativeFn(n)) => Ok(n.arity),
            _ => Err(self.wrong_type(slot, "function", v)),
        }
    }

    fn wrong_type(&self, slot: usize, wanted: &str, v: Value) -> VmError {
        VmError::new(
            ErrorCode::InvalidArgument,
            0,
            format!(
                "slot {slot}: expected {wanted}, got {}",
                self.heap.type_name(v)
            ),
        )
    }

    // =========================================================================
    // Native-call context
    // =========================================================================

    /// A static slot of the currently executing native function.
    pub fn native_static(&self, idx: usize) -> Result<Value, VmError> {
        match self.current_native.map(|r| self.heap.obj(r)) {
            Some(Obj::NativeFn(n)) => n.statics.get(idx).copied().ok_or_else(|| {
                VmError::new(ErrorCode::InvalidArgument, 0, "static index out of range")
            }),
            _ => Err(VmError::new(
                ErrorCode::InvalidArgument,
                0,
                "no native call in progress",
            )),
        }
    }

    pub fn set_native_static(&mut self, idx: usize, v: Value) -> Result<(), VmError> {
        let Some(r) = self.current_native else {
            return Err(VmError::new(
                ErrorCode::InvalidArgument,
                0,
                "no native call in progress",
            ));
        };
        match self.heap.obj_mut(r) {
            Obj::NativeFn(n) if idx < n.statics.len() => {
                n.statics[idx] = v;
                Ok(())
            }
            _ => Err(VmError::new(
                ErrorCode::InvalidArgument,
                0,
                "static index out of range",
            )),
        }
    }

    /// The extra-data bytes of the currently executing native function.
    pub fn native_data(&mut self) -> Result<&mut [u8], VmError> {
        let Some(r) = self.current_native else {
            return Err(VmError::new(
                ErrorCode::InvalidArgument,
                0,
                "no native call in progress",
            ));
        };
        match self.heap.obj_mut(r) {
            Obj::NativeFn(n) => Ok(&mut n.extra),
            _ => Err(VmError::new(
                ErrorCode::InvalidArgument,
                0,
                "no native call in progress",
            )),
        }
    }

    // =========================================================================
    // Handles
    // =========================================================================

    /// Root the value in `slot` for as long as the handle lives.
    pub fn make_handle(&mut self, slot: usize) -> Result<Handle, VmError> {
        let v = self.slot_value(slot)?;
        let id = match self.free_handles.pop() {
            Some(id) => {
                self.handles[id as usize] = Some(v);
                id
            }
            None => {
                self.handles.push(Some(v));
                (self.handles.len() - 1) as u32
            }
        };
        Ok(Handle(id))
    }

    /// Copy a handle's value into `slot`.
    pub fn load_handle(&mut self, handle: Handle, slot: usize) -> Result<(), VmError> {
        let v = self
            .handles
            .get(handle.0 as usize)
            .copied()
            .flatten()
            .ok_or_else(|| VmError::new(ErrorCode::InvalidArgument, 0, "dead handle"))?;
        self.set_slot_value(slot, v);
        Ok(())
    }

    /// Release a handle; its id returns to the free pool.
    pub fn destroy_handle(&mut self, handle: Handle) {
        if let Some(entry) = self.handles.get_mut(handle.0 as usize)
            && entry.take().is_some()
        {
            self.free_handles.push(handle.0);
        }
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// Call the value in slot 0 with arguments in slots `1..=num_args`.
    /// The result replaces slot 0.
    pub fn call(&mut self, num_args: usize) -> Result<(), VmError> {
        self.maybe_collect();
        let base = self.api_base();
        let needed = base + 1 + num_args;
        if self.stack_top < needed {
            return Err(VmError::new(
                ErrorCode::InvalidArgument,
                0,
                "call window is smaller than num_args + 1",
            ));
        }
        let callee = self.stack[base];
        let result = self.call_value(callee, base + 1, num_args)?;
        self.stack[base] = result;
        Ok(())
    }
}
