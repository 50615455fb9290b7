//! Native class and function binding.
//!
//! A [`ClassBinding`] describes a host-implemented class: per-instance
//! extra-data size, a method list (each a native function with declared
//! arity, static slots and its own extra bytes), and an optional native
//! finalizer the collector runs before an instance is freed. Bindings are
//! built fluently and attached to a module with [`Vm::bind_class`].

use crate::error::{ErrorCode, VmError};
use crate::object::{NativeFinalizer, NativeFn, Obj, ObjClass, ObjNativeFn};
use crate::vm::Vm;
use ember_core::Value;

/// One native method of a class binding.
pub struct MethodBinding {
    pub name: String,
    pub func: NativeFn,
    /// Declared arity including the receiver; −1 accepts anything.
    pub arity: i32,
    pub num_statics: usize,
    pub extra_size: usize,
}

impl MethodBinding {
    pub fn new(name: impl Into<String>, arity: i32, func: NativeFn) -> Self {
        MethodBinding {
            name: name.into(),
            func,
            arity,
            num_statics: 0,
            extra_size: 0,
        }
    }

    pub fn with_statics(mut self, n: usize) -> Self {
        self.num_statics = n;
        self
    }

    pub fn with_extra_size(mut self, bytes: usize) -> Self {
        self.extra_size = bytes;
        self
    }
}

/// A host-implemented class, ready to attach to a module.
pub struct ClassBinding {
    pub name: String,
    /// Inline host bytes carried by every instance.
    pub extra_size: usize,
    pub methods: Vec<MethodBinding>,
    pub finalizer: Option<NativeFinalizer>,
}

impl ClassBinding {
    pub fn new(name: impl Into<String>) -> Self {
        ClassBinding {
            name: name.into(),
            extra_size: 0,
            methods: Vec::new(),
            finalizer: None,
        }
    }

    pub fn with_extra_size(mut self, bytes: usize) -> Self {
        self.extra_size = bytes;
        self
    }

    pub fn with_method(mut self, method: MethodBinding) -> Self {
        self.methods.push(method);
        self
    }

    pub fn with_finalizer(mut self, finalizer: NativeFinalizer) -> Self {
        self.finalizer = Some(finalizer);
        self
    }
}

impl Vm {
    /// Create the class described by `binding` and store it in the module
    /// sitting in `module_slot`, under the binding's name.
    pub fn bind_class(&mut self, module_slot: usize, binding: ClassBinding) -> Result<(), VmError> {
        let module_val = self.slot_value(module_slot)?;
        let Some(module) = module_val.object_ref().filter(|r| {
            matches!(self.heap.obj(*r), Obj::Module(_))
        }) else {
            return Err(VmError::new(
                ErrorCode::InvalidArgument,
                0,
                format!("slot {module_slot} does not hold a module"),
            ));
        };

        let mut class = ObjClass::new(&binding.name, None, Some(module));
        class.extra_size = binding.extra_size;
        class.finalizer = binding.finalizer;
        let class = self.heap.alloc(Obj::Class(class));
        // Pin until the module variable below makes it reachable.
        self.heap.push_temp_root(Value::object(class));

        for method in binding.methods {
            let sym = self.symbols.symbol(&method.name);
            let native = self.heap.alloc(Obj::NativeFn(ObjNativeFn {
                name: format!("{}.{}", binding.name, method.name),
                func: method.func,
                arity: method.arity,
                statics: vec![Value::NIL; method.num_statics],
                extra: vec![0u8; method.extra_size].into_boxed_slice(),
            }));
            if let Obj::Class(c) = self.heap.obj_mut(class) {
                c.set_symbol(sym, Value::object(native));
            }
        }

        let name_sym = self.symbols.symbol(&binding.name);
        if let Obj::Module(m) = self.heap.obj_mut(module) {
            m.set(name_sym, Value::object(class));
        }
        self.heap.pop_temp_root();
        Ok(())
    }

    /// Bind a single native function as a variable of the module in
    /// `module_slot`.
    pub fn bind_native_fn(
        &mut self,
        module_slot: usize,
        name: &str,
        arity: i32,
        func: NativeFn,
    ) -> Result<(), VmError> {
        let module_val = self.slot_value(module_slot)?;
        let Some(module) = module_val.object_ref().filter(|r| {
            matches!(self.heap.obj(*r), Obj::Module(_))
        }) else {
            return Err(VmError::new(
                ErrorCode::InvalidArgument,
                0,
                format!("slot {module_slot} does not hold a module"),
            ));
        };
        let native = self.heap.alloc(Obj::NativeFn(ObjNativeFn {
            name: name.to_string(),
            func,
            arity,
            statics: Vec::new(),
            extra: Box::new([]),
        }));
        let sym = self.symbols.symbol(name);
        if let Obj::Module(m) = self.heap.obj_mut(module) {
            m.set(sym, Value::object(native));
        }
        Ok(())
    }
}
