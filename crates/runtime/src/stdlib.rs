//! Standard modules, selected by bitmask.
//!
//! Only `std:io` exists today: it binds `print`, which formats its
//! arguments with the display formatter and hands the joined line to the
//! host's print hook.

use bitflags::bitflags;

use crate::error::VmError;
use crate::object::{Obj, ObjModule, ObjNativeFn};
use crate::vm::Vm;
use ember_core::Value;

bitflags! {
    /// Which standard modules to register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StdModules: u32 {
        const IO = 1 << 0;
    }
}

impl Vm {
    /// Register the selected standard modules. Already-loaded modules are
    /// left alone.
    pub fn load_stdlib(&mut self, modules: StdModules) -> Result<(), VmError> {
        if modules.contains(StdModules::IO) && !self.modules.contains_key("std:io") {
            let module = self.heap.alloc(Obj::Module(ObjModule::new("std:io")));
            self.modules.insert("std:io".to_string(), module);
            let native = self.heap.alloc(Obj::NativeFn(ObjNativeFn {
                name: "print".to_string(),
                func: io_print,
                arity: -1,
                statics: Vec::new(),
                extra: Box::new([]),
            }));
            let sym = self.symbols.symbol("print");
            if let Obj::Module(m) = self.heap.obj_mut(module) {
                m.set(sym, Value::object(native));
            }
        }
        Ok(())
    }
}

/// `print(...)`: any number of arguments, space-separated, one trailing
/// newline. Returns nil.
fn io_print(vm: &mut Vm) -> Result<(), VmError> {
    let argc = vm.slot_count();
    let mut out = String::new();
    for i in 0..argc {
        if i > 0 {
            out.push(' ');
        }
        let v = vm.slot_value(i)?;
        out.push_str(&vm.heap.format_value(v));
    }
    out.push('\n');
    vm.host.print(&out);
    vm.set_slot_value(0, Value::NIL);
    Ok(())
}
