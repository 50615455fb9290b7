//! The module registry and source execution.
//!
//! Modules are named bags of symbol-indexed variables. Hosts create them
//! empty (`make_module`), fill them through class bindings and native
//! functions, or have them built by the compiler (`execute_in_module`,
//! `import`). Unloading only drops the registry entry; the collector
//! reclaims the object once nothing else reaches it.

use crate::compile_env::CompileView;
use crate::error::{ErrorCode, VmError};
use crate::object::{Obj, ObjModule};
use crate::vm::Vm;
use ember_core::Value;

impl Vm {
    /// Create an empty module. Fails if the name is taken.
    /// The module lands in `slot`.
    pub fn make_module(&mut self, slot: usize, name: &str) -> Result<(), VmError> {
        if self.modules.contains_key(name) {
            return Err(VmError::new(
                ErrorCode::ModuleAlreadyDefined,
                0,
                format!("module '{name}' is already defined"),
            ));
        }
        let module = self.heap.alloc(Obj::Module(ObjModule::new(name)));
        self.modules.insert(name.to_string(), module);
        self.set_slot_value(slot, Value::object(module));
        Ok(())
    }

    /// Load a registered module into `slot`. Fails if it does not exist.
    pub fn load_module(&mut self, slot: usize, name: &str) -> Result<(), VmError> {
        let Some(module) = self.modules.get(name).copied() else {
            return Err(VmError::new(
                ErrorCode::ModuleNotFound,
                0,
                format!("module '{name}' not found"),
            ));
        };
        self.set_slot_value(slot, Value::object(module));
        Ok(())
    }

    /// Drop a module from the registry. The object itself is reclaimed by
    /// the collector once unreachable.
    pub fn unload_module(&mut self, name: &str) -> Result<(), VmError> {
        if self.modules.remove(name).is_none() {
            return Err(VmError::new(
                ErrorCode::ModuleNotFound,
                0,
                format!("module '{name}' not found"),
            ));
        }
        Ok(())
    }

    pub fn unload_all_modules(&mut self) {
        self.modules.clear();
    }

    /// Read variable `name` of the module in `module_slot` into
    /// `dst_slot`.
    pub fn module_variable(
        &mut self,
        module_slot: usize,
        name: &str,
        dst_slot: usize,
    ) -> Result<(), VmError> {
        let v = self.slot_value(module_slot)?;
        let value = match v.object_ref().map(|r| self.heap.obj(r)) {
            Some(Obj::Module(m)) => self
                .symbols
                .find(name)
                .and_then(|sym| m.get(sym))
                .ok_or_else(|| {
                    VmError::new(
                        ErrorCode::Runtime,
                        0,
                        format!("module '{}' has no variable '{name}'", m.name),
                    )
                })?,
            _ => {
                return Err(VmError::new(
                    ErrorCode::InvalidArgument,
                    0,
                    format!("slot {module_slot} does not hold a module"),
                ));
            }
        };
        self.set_slot_value(dst_slot, value);
        Ok(())
    }

    /// Write `src_slot`'s value into variable `name` of the module in
    /// `module_slot`, declaring the variable if needed.
    pub fn set_module_variable(
        &mut self,
        module_slot: usize,
        name: &str,
        src_slot: usize,
    ) -> Result<(), VmError> {
        let module = self.slot_value(module_slot)?;
        let value = self.slot_value(src_slot)?;
        let sym = self.symbols.symbol(name);
        match module.object_ref() {
            Some(r) => match self.heap.obj_mut(r) {
                Obj::Module(m) => {
                    m.set(sym, value);
                    Ok(())
                }
                _ => Err(VmError::new(
                    ErrorCode::InvalidArgument,
                    0,
                    format!("slot {module_slot} does not hold a module"),
                )),
            },
            None => Err(VmError::new(
                ErrorCode::InvalidArgument,
                0,
                format!("slot {module_slot} does not hold a module"),
            )),
        }
    }

    /// Compile and run `source` in a fresh module — named and registered,
    /// or anonymous. On success the module object is left in slot 0.
    pub fn execute_in_module(
        &mut self,
        name: Option<&str>,
        source: &str,
    ) -> Result<(), VmError> {
        self.maybe_collect();
        if let Some(n) = name
            && self.modules.contains_key(n)
        {
            return Err(VmError::new(
                ErrorCode::ModuleAlreadyDefined,
                0,
                format!("module '{n}' is already defined"),
            ));
        }
        let mod_name = name.unwrap_or("<anonymous>").to_string();
        tracing::debug!(module = %mod_name, "compiling module source");
        let module = self.heap.alloc(Obj::Module(ObjModule::new(&mod_name)));
        if let Some(n) = name {
            self.modules.insert(n.to_string(), module);
        }
        // Pin the module (and through it, everything the compile attaches)
        // until its init function has run.
        self.heap.push_temp_root(Value::object(module));

        let compiled = {
            let mut view = CompileView { vm: self };
            ember_compiler::compile(&mut view, Value::object(module), source)
        };
        let init = match compiled {
            Ok(init) => init,
            Err(errors) => {
                self.heap.pop_temp_root();
                if let Some(n) = name {
                    self.modules.remove(n);
                }
                return Err(self.report_compile_errors(&mod_name, errors));
            }
        };
        let init_ref = init.object_ref();
        if let Obj::Module(m) = self.heap.obj_mut(module) {
            m.init_fn = init_ref;
        }

        let run = self.call_detached(init, &[]);
        self.heap.pop_temp_root();
        run?;

        self.set_slot_value(0, Value::object(module));
        Ok(())
    }

    fn report_compile_errors(
        &mut self,
        module: &str,
        errors: ember_compiler::CompileErrors,
    ) -> VmError {
        for e in &errors.0 {
            self.host
                .error(ErrorCode::Compile, module, e.line, &e.message);
        }
        let line = errors.0.first().map_or(0, |e| e.line);
        let message = errors.to_string();
        self.last_error = message.clone();
        VmError::new(ErrorCode::Compile, line, message)
    }
}
