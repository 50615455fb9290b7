//! Ember Runtime: the virtual machine, garbage collector and embedding API
//! for the Ember scripting language.
//!
//! A [`Vm`] owns everything: the arena heap, the interned symbol table,
//! the module registry, the operand stack and the call frames. Hosts drive
//! it through the slot-based embedding API:
//!
//! ```no_run
//! use ember_runtime::{StdModules, Vm, VmParams};
//!
//! let mut vm = Vm::new(VmParams::default());
//! vm.load_stdlib(StdModules::IO).unwrap();
//! vm.execute_in_module(Some("main"), "import \"std:io\" for print; print(1 + 2 * 3);")
//!     .unwrap();
//! ```
//!
//! Compilation is delegated to `ember-compiler` through the
//! [`CompileEnv`](ember_compiler::CompileEnv) seam implemented in
//! `compile_env`; values and bytecode come from `ember-core`.
//!
//! A VM instance is single-threaded: no operation may be invoked from two
//! threads at once, and the only blocking the VM ever does is inside the
//! host's own hooks.

pub mod api;
pub mod binding;
pub mod config;
pub mod error;
pub mod gc;
pub mod heap;
pub mod module;
pub mod object;
pub mod stdlib;
pub mod vm;

mod compile_env;

pub use api::{Handle, ValueType};
pub use binding::{ClassBinding, MethodBinding};
pub use config::{DefaultHost, Host, VmParams};
pub use error::{ErrorCode, VmError};
pub use object::{NativeFinalizer, NativeFn};
pub use stdlib::StdModules;
pub use vm::Vm;

pub use ember_core::{ObjRef, Value};

impl Default for Vm {
    fn default() -> Self {
        Vm::new(VmParams::default())
    }
}
