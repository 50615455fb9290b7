//! The compiler/runtime seam.
//!
//! Single-pass compilation writes finished objects (strings, functions,
//! classes) straight into the live module it is compiling against, so the
//! compiler needs heap services — but the heap, the object model and the
//! module registry belong to `ember-runtime`. [`CompileEnv`] is the trait
//! the runtime implements to lend those services out. Values returned from
//! env calls are ordinary boxed heap references; the compiler treats them
//! as opaque.
//!
//! No garbage collection happens during a compile (collection only runs at
//! interpreter and API safe points), so values held in builder constant
//! pools cannot be swept mid-parse.

use crate::error::CompileError;
use ember_core::{Instr, Value};

/// A finished function body, ready for heap placement.
///
/// The runtime turns this into a function object attached to the module
/// being compiled.
#[derive(Debug)]
pub struct FnProto {
    pub name: String,
    /// Declared parameter count; methods include the implicit `self`.
    /// `-1` marks a variadic native and never originates here.
    pub arity: i32,
    /// Constant pool, de-duplicated by exact bit equality.
    pub constants: Vec<Value>,
    pub code: Vec<Instr>,
    /// Source line per instruction, parallel to `code`.
    pub lines: Vec<u32>,
    /// Operand-stack slots the frame needs above its base.
    pub needed_stack: usize,
}

/// Why an `import` could not produce a module.
#[derive(Debug)]
pub enum ImportError {
    /// The registry missed and the host's module loader declined the name.
    NotFound,
    /// The imported source failed to compile.
    Failed(Vec<CompileError>),
}

/// Heap and module services the compiler borrows from the runtime.
pub trait CompileEnv {
    /// Intern a name, returning its stable symbol id.
    fn intern(&mut self, name: &str) -> u32;

    /// Allocate a script string.
    fn new_string(&mut self, text: String) -> Value;

    /// Allocate a function object owned by `module`.
    fn new_function(&mut self, module: Value, proto: FnProto) -> Value;

    /// Allocate a class owned by `module`, with an optional base class.
    fn new_class(&mut self, module: Value, name: &str, base: Option<Value>) -> Value;

    /// True when the value is a class object.
    fn is_class(&self, v: Value) -> bool;

    /// The base class of `class`, if it has one.
    fn class_base(&self, class: Value) -> Option<Value>;

    /// Bind a method or static into a class's symbol table.
    fn class_set_symbol(&mut self, class: Value, sym: u32, value: Value);

    /// Append a field initializer `(symbol, constant)` to a class.
    fn class_add_field(&mut self, class: Value, sym: u32, init: Value);

    /// Ensure `module` has a declared slot for `sym` (nil-valued if new).
    fn module_declare(&mut self, module: Value, sym: u32);

    /// Read a declared module variable; `None` when the slot was never
    /// declared (a gap), `Some(nil)` when declared but unset.
    fn module_get(&self, module: Value, sym: u32) -> Option<Value>;

    /// Write a module variable, declaring the slot if needed.
    fn module_set(&mut self, module: Value, sym: u32, value: Value);

    /// Every declared `(symbol, value)` pair of a module, in slot order.
    fn module_declared(&self, module: Value) -> Vec<(u32, Value)>;

    /// The module's registry name.
    fn module_name(&self, module: Value) -> String;

    /// Resolve an import: registry hit, or load + compile the source the
    /// host hands back. The new module is registered before its body
    /// compiles, so circular imports terminate.
    fn import_module(&mut self, name: &str) -> Result<Value, ImportError>;
}
