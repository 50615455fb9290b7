//! Shared test harness: a host that records prints and error reports and
//! serves modules from an in-memory map.
#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use ember_runtime::{ErrorCode, Host, Vm, VmParams};

#[derive(Default)]
pub struct Captured {
    pub prints: Vec<String>,
    pub errors: Vec<(ErrorCode, String, u32, String)>,
}

impl Captured {
    pub fn printed(&self) -> String {
        self.prints.concat()
    }

    pub fn error_codes(&self) -> Vec<ErrorCode> {
        self.errors.iter().map(|(c, _, _, _)| *c).collect()
    }
}

pub struct RecordingHost {
    captured: Rc<RefCell<Captured>>,
    modules: HashMap<String, String>,
}

impl Host for RecordingHost {
    fn print(&mut self, text: &str) {
        self.captured.borrow_mut().prints.push(text.to_string());
    }

    fn error(&mut self, code: ErrorCode, context: &str, line: u32, message: &str) {
        self.captured.borrow_mut().errors.push((
            code,
            context.to_string(),
            line,
            message.to_string(),
        ));
    }

    fn load_module(&mut self, name: &str) -> Option<String> {
        self.modules.get(name).cloned()
    }
}

/// A VM with a recording host and no loadable modules.
pub fn recording_vm() -> (Vm, Rc<RefCell<Captured>>) {
    recording_vm_with_modules(&[])
}

/// A VM whose host serves the given `(name, source)` modules to `import`.
pub fn recording_vm_with_modules(modules: &[(&str, &str)]) -> (Vm, Rc<RefCell<Captured>>) {
    let captured = Rc::new(RefCell::new(Captured::default()));
    let host = RecordingHost {
        captured: Rc::clone(&captured),
        modules: modules
            .iter()
            .map(|(n, s)| (n.to_string(), s.to_string()))
            .collect(),
    };
    let vm = Vm::new(VmParams::new().with_host(Box::new(host)));
    (vm, captured)
}

/// Execute source in a module and read one of its number variables back.
pub fn run_and_read_number(vm: &mut Vm, source: &str, var: &str) -> f64 {
    vm.execute_in_module(Some("t"), source).expect("execute");
    vm.module_variable(0, var, 0).expect("module variable");
    vm.slot_number(0).expect("number")
}
