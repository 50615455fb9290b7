//! The runtime's side of the compiler seam.
//!
//! [`CompileView`] lends the compiler heap allocation, symbol interning,
//! module slots and import resolution, all against a mutably borrowed VM.
//! Imports recurse through here: a registry miss asks the host for source,
//! registers the new module *first* (so circular imports terminate) and
//! compiles it with the same view.

use crate::object::{Obj, ObjClass, ObjFn, ObjModule};
use crate::vm::Vm;
use ember_compiler::{CompileEnv, FnProto, ImportError};
use ember_core::{ObjRef, Value};

pub(crate) struct CompileView<'a> {
    pub vm: &'a mut Vm,
}

impl CompileView<'_> {
    fn module_ref(&self, v: Value) -> ObjRef {
        v.object_ref().expect("compiler handed a non-object module")
    }
}

impl CompileEnv for CompileView<'_> {
    fn intern(&mut self, name: &str) -> u32 {
        self.vm.symbols.symbol(name)
    }

    fn new_string(&mut self, text: String) -> Value {
        self.vm.heap.new_string(text)
    }

    fn new_function(&mut self, module: Value, proto: FnProto) -> Value {
        let module = self.module_ref(module);
        let func = ObjFn {
            module,
            name: proto.name,
            arity: proto.arity,
            constants: proto.constants,
            code: proto.code,
            lines: proto.lines,
            needed_stack: proto.needed_stack,
        };
        Value::object(self.vm.heap.alloc(Obj::Fn(func)))
    }

    fn new_class(&mut self, module: Value, name: &str, base: Option<Value>) -> Value {
        let module = self.module_ref(module);
        let base = base.and_then(Value::object_ref);
        let class = ObjClass::new(name, base, Some(module));
        Value::object(self.vm.heap.alloc(Obj::Class(class)))
    }

    fn is_class(&self, v: Value) -> bool {
        matches!(
            v.object_ref().map(|r| self.vm.heap.obj(r)),
            Some(Obj::Class(_))
        )
    }

    fn class_base(&self, class: Value) -> Option<Value> {
        match class.object_ref().map(|r| self.vm.heap.obj(r)) {
            Some(Obj::Class(c)) => c.base.map(Value::object),
            _ => None,
        }
    }

    fn class_set_symbol(&mut self, class: Value, sym: u32, value: Value) {
        if let Some(r) = class.object_ref()
            && let Obj::Class(c) = self.vm.heap.obj_mut(r)
        {
            c.set_symbol(sym, value);
        }
    }

    fn class_add_field(&mut self, class: Value, sym: u32, init: Value) {
        if let Some(r) = class.object_ref()
            && let Obj::Class(c) = self.vm.heap.obj_mut(r)
        {
            c.field_inits.push((sym, init));
        }
    }

    fn module_declare(&mut self, module: Value, sym: u32) {
        let r = self.module_ref(module);
        if let Obj::Module(m) = self.vm.heap.obj_mut(r) {
            m.declare(sym);
        }
    }

    fn module_get(&self, module: Value, sym: u32) -> Option<Value> {
        let r = self.module_ref(module);
        match self.vm.heap.obj(r) {
            Obj::Module(m) => m.get(sym),
            _ => None,
        }
    }

    fn module_set(&mut self, module: Value, sym: u32, value: Value) {
        let r = self.module_ref(module);
        if let Obj::Module(m) = self.vm.heap.obj_mut(r) {
            m.set(sym, value);
        }
    }

    fn module_declared(&self, module: Value) -> Vec<(u32, Value)> {
        let r = self.module_ref(module);
        match self.vm.heap.obj(r) {
            Obj::Module(m) => m.declared().collect(),
            _ => Vec::new(),
        }
    }

    fn module_name(&self, module: Value) -> String {
        let r = self.module_ref(module);
        match self.vm.heap.obj(r) {
            Obj::Module(m) => m.name.clone(),
            _ => String::new(),
        }
    }

    fn import_module(&mut self, name: &str) -> Result<Value, ImportError> {
        if let Some(r) = self.vm.modules.get(name) {
            return Ok(Value::object(*r));
        }
        let Some(source) = self.vm.host.load_module(name) else {
            return Err(ImportError::NotFound);
        };
        tracing::debug!(module = name, "compiling imported module");
        let module = self.vm.heap.alloc(Obj::Module(ObjModule::new(name)));
        // Register before compiling so a circular import resolves to the
        // partially built module instead of recursing forever.
        self.vm.modules.insert(name.to_string(), module);
        match ember_compiler::compile(self, Value::object(module), &source) {
            Ok(init) => {
                let init_ref = init.object_ref();
                if let Obj::Module(m) = self.vm.heap.obj_mut(module) {
                    m.init_fn = init_ref;
                }
                Ok(Value::object(module))
            }
            Err(errors) => {
                self.vm.modules.remove(name);
                Err(ImportError::Failed(errors.0))
            }
        }
    }
}
