//! Embedding API tests: slots, handles, modules, native bindings, error
//! reporting and host reentry.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};

use common::recording_vm;
use ember_runtime::{
    ClassBinding, ErrorCode, Host, MethodBinding, StdModules, ValueType, Vm, VmError, VmParams,
};

#[test]
fn test_slot_round_trips() {
    let (mut vm, _) = recording_vm();
    vm.ensure_slots(4);
    vm.set_slot_number(0, 2.5);
    vm.set_slot_bool(1, true);
    vm.set_slot_nil(2);
    vm.set_slot_string(3, "hello");

    assert_eq!(vm.slot_type(0).unwrap(), ValueType::Number);
    assert_eq!(vm.slot_number(0).unwrap(), 2.5);
    assert_eq!(vm.slot_type(1).unwrap(), ValueType::Bool);
    assert!(vm.slot_bool(1).unwrap());
    assert_eq!(vm.slot_type(2).unwrap(), ValueType::Nil);
    assert_eq!(vm.slot_type(3).unwrap(), ValueType::Str);
    assert_eq!(vm.slot_string(3).unwrap(), "hello");

    // Type mismatches are InvalidArgument, not panics.
    let err = vm.slot_number(3).unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidArgument);
    // Out-of-window reads are errors too.
    assert!(vm.slot_number(17).is_err());
}

#[test]
fn test_module_lifecycle() {
    let (mut vm, _) = recording_vm();
    vm.make_module(0, "m").unwrap();
    assert_eq!(vm.slot_type(0).unwrap(), ValueType::Module);

    let err = vm.make_module(0, "m").unwrap_err();
    assert_eq!(err.code, ErrorCode::ModuleAlreadyDefined);

    vm.load_module(1, "m").unwrap();
    assert_eq!(vm.slot_type(1).unwrap(), ValueType::Module);

    vm.unload_module("m").unwrap();
    let err = vm.load_module(1, "m").unwrap_err();
    assert_eq!(err.code, ErrorCode::ModuleNotFound);

    // The name is free again.
    vm.make_module(0, "m").unwrap();
    vm.unload_all_modules();
    assert!(vm.load_module(0, "m").is_err());
}

#[test]
fn test_execute_in_anonymous_module() {
    let (mut vm, _) = recording_vm();
    vm.execute_in_module(None, "var x = 1;").unwrap();
    assert_eq!(vm.slot_type(0).unwrap(), ValueType::Module);
    // Anonymous modules never enter the registry, so a second one is fine.
    vm.execute_in_module(None, "var x = 2;").unwrap();
}

#[test]
fn test_execute_in_module_name_collision() {
    let (mut vm, _) = recording_vm();
    vm.execute_in_module(Some("main"), "var x = 1;").unwrap();
    let err = vm.execute_in_module(Some("main"), "var x = 2;").unwrap_err();
    assert_eq!(err.code, ErrorCode::ModuleAlreadyDefined);
}

#[test]
fn test_compile_errors_are_reported_per_diagnostic() {
    let (mut vm, captured) = recording_vm();
    let err = vm
        .execute_in_module(Some("bad"), "var = 1;\nfunc = 2;\n")
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Compile);
    let captured = captured.borrow();
    let compile_reports = captured
        .errors
        .iter()
        .filter(|(c, ctx, _, _)| *c == ErrorCode::Compile && ctx == "bad")
        .count();
    assert!(compile_reports >= 2, "one report per diagnostic");
    // The registry must not keep the failed module.
    drop(captured);
    vm.execute_in_module(Some("bad"), "var ok = 1;").unwrap();
}

#[test]
fn test_runtime_error_emits_stack_trace_and_vm_survives() {
    let (mut vm, captured) = recording_vm();
    vm.execute_in_module(
        Some("t"),
        "func inner() { return 1 + nil; }\n\
         func outer() { return inner(); }",
    )
    .unwrap();
    vm.module_variable(0, "outer", 0).unwrap();
    let err = vm.call(0).unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidOpOnType);
    assert_eq!(err.line, 1);
    assert_eq!(vm.last_error(), err.message);

    {
        let captured = captured.borrow();
        let codes = captured.error_codes();
        let begin = codes
            .iter()
            .position(|c| *c == ErrorCode::StackTraceBegin)
            .expect("trace begin");
        let end = codes
            .iter()
            .position(|c| *c == ErrorCode::StackTraceEnd)
            .expect("trace end");
        let frames = codes[begin..end]
            .iter()
            .filter(|c| **c == ErrorCode::StackTraceFrame)
            .count();
        assert_eq!(frames, 2, "one frame per popped call");
        // Innermost frame first, named after the failing function.
        let first_frame = captured
            .errors
            .iter()
            .find(|(c, _, _, _)| *c == ErrorCode::StackTraceFrame)
            .expect("frame report");
        assert_eq!(first_frame.1, "inner");
        assert_eq!(first_frame.2, 1);
    }

    // The VM stays usable after unwinding.
    vm.load_module(0, "t").unwrap();
    vm.module_variable(0, "outer", 0).unwrap();
    vm.execute_in_module(Some("u"), "var ok = 40 + 2;").unwrap();
    vm.module_variable(0, "ok", 0).unwrap();
    assert_eq!(vm.slot_number(0).unwrap(), 42.0);
}

#[test]
fn test_arity_mismatch() {
    let (mut vm, _) = recording_vm();
    vm.execute_in_module(Some("t"), "func two(a, b) { return a + b; }")
        .unwrap();
    vm.module_variable(0, "two", 0).unwrap();
    vm.set_slot_number(1, 1.0);
    let err = vm.call(1).unwrap_err();
    assert_eq!(err.code, ErrorCode::FnArityMismatch);
    assert!(err.message.contains("expects 2"));
}

#[test]
fn test_missing_symbol_names_the_class_chain() {
    let (mut vm, _) = recording_vm();
    let err = vm
        .execute_in_module(
            Some("t"),
            "class A { }\nclass B : A { }\nvar r = new B().nope;",
        )
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Runtime);
    assert!(err.message.contains("nope"));
    assert!(err.message.contains('B'));
    assert!(err.message.contains('A'));
}

#[test]
fn test_call_on_non_callable() {
    let (mut vm, _) = recording_vm();
    let err = vm
        .execute_in_module(Some("t"), "var x = 1; x();")
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidOpOnType);
}

#[test]
fn test_new_on_non_class() {
    let (mut vm, _) = recording_vm();
    let err = vm
        .execute_in_module(Some("t"), "var NotAClass = 3; var x = new NotAClass;")
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidOpOnType);
    assert!(err.message.contains("class"));
}

static COUNTER_HITS: AtomicUsize = AtomicUsize::new(0);

fn counter_incr(vm: &mut Vm) -> Result<(), VmError> {
    COUNTER_HITS.fetch_add(1, Ordering::SeqCst);
    // Statics persist across calls of the same native.
    let n = match vm.native_static(0)? {
        v if v.is_number() => v.as_number(),
        _ => 0.0,
    };
    vm.set_native_static(0, ember_runtime::Value::number(n + 1.0))?;
    vm.set_slot_number(0, n + 1.0);
    Ok(())
}

fn counter_data_poke(vm: &mut Vm) -> Result<(), VmError> {
    // Instance extra data: slot 0 is the receiver.
    let data = vm.slot_instance_data(0)?;
    data[0] = data[0].wrapping_add(1);
    let v = f64::from(data[0]);
    vm.set_slot_number(0, v);
    Ok(())
}

#[test]
fn test_native_class_binding() {
    let (mut vm, _) = recording_vm();
    vm.make_module(0, "host").unwrap();
    vm.bind_class(
        0,
        ClassBinding::new("Counter")
            .with_extra_size(4)
            .with_method(MethodBinding::new("incr", -1, counter_incr).with_statics(1))
            .with_method(MethodBinding::new("poke", 1, counter_data_poke)),
    )
    .unwrap();

    vm.execute_in_module(
        Some("t"),
        "import \"host\" for Counter;\n\
         var c = new Counter();\n\
         var a = c.incr();\n\
         var b = c.incr();\n\
         var p1 = c.poke();\n\
         var p2 = c.poke();",
    )
    .unwrap();

    assert_eq!(COUNTER_HITS.load(Ordering::SeqCst), 2);
    vm.module_variable(0, "b", 1).unwrap();
    assert_eq!(vm.slot_number(1).unwrap(), 2.0, "statics persist");
    vm.module_variable(0, "p2", 1).unwrap();
    assert_eq!(vm.slot_number(1).unwrap(), 2.0, "instance data persists");
}

fn native_fail(vm: &mut Vm) -> Result<(), VmError> {
    Err(vm.error(ErrorCode::InvalidArgument, "host said no"))
}

#[test]
fn test_native_error_propagates_and_unwinds() {
    let (mut vm, captured) = recording_vm();
    vm.make_module(0, "host").unwrap();
    vm.bind_native_fn(0, "fail", 0, native_fail).unwrap();
    let err = vm
        .execute_in_module(Some("t"), "import \"host\" for fail; fail();")
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidArgument);
    assert!(err.message.contains("host said no"));
    assert!(
        captured
            .borrow()
            .error_codes()
            .contains(&ErrorCode::StackTraceBegin)
    );
}

fn native_reenter(vm: &mut Vm) -> Result<(), VmError> {
    // Re-enter the interpreter from inside a native call: the argument is
    // a script function, called with 5.
    vm.ensure_slots(2);
    vm.set_slot_number(1, 5.0);
    vm.call(1)?;
    let n = vm.slot_number(0)?;
    vm.set_slot_number(0, n * 10.0);
    Ok(())
}

#[test]
fn test_native_reentry_into_interpreter() {
    let (mut vm, _) = recording_vm();
    vm.make_module(0, "host").unwrap();
    vm.bind_native_fn(0, "apply", 1, native_reenter).unwrap();
    vm.execute_in_module(
        Some("t"),
        "import \"host\" for apply;\n\
         func addOne(x) { return x + 1; }\n\
         var r = apply(addOne);",
    )
    .unwrap();
    vm.module_variable(0, "r", 0).unwrap();
    assert_eq!(vm.slot_number(0).unwrap(), 60.0);
}

#[test]
fn test_references_carry_host_data() {
    static REF_DEAD: AtomicUsize = AtomicUsize::new(0);
    fn fin(data: &mut [u8]) {
        assert_eq!(data[0], 99);
        REF_DEAD.fetch_add(1, Ordering::SeqCst);
    }

    let (mut vm, _) = recording_vm();
    vm.make_module(0, "host").unwrap();
    vm.bind_class(
        0,
        ClassBinding::new("Blob").with_extra_size(16).with_finalizer(fin),
    )
    .unwrap();
    vm.module_variable(0, "Blob", 1).unwrap();
    vm.make_reference(2, 1).unwrap();
    assert_eq!(vm.slot_type(2).unwrap(), ValueType::Reference);
    vm.slot_instance_data(2).unwrap()[0] = 99;

    vm.collect_garbage();
    assert_eq!(REF_DEAD.load(Ordering::SeqCst), 0, "slot keeps it alive");

    vm.set_slot_nil(2);
    vm.collect_garbage();
    assert_eq!(REF_DEAD.load(Ordering::SeqCst), 1);
}

#[test]
fn test_weak_refs_do_not_own() {
    let (mut vm, _) = recording_vm();
    let mut payload: u64 = 7;
    vm.make_weak_ref(0, None, (&mut payload as *mut u64).cast())
        .unwrap();
    assert_eq!(vm.slot_type(0).unwrap(), ValueType::WeakRef);
    // Collection with the weak ref live must not touch host memory.
    vm.collect_garbage();
    assert_eq!(payload, 7);
}

struct FileHost {
    dir: std::path::PathBuf,
}

impl Host for FileHost {
    fn load_module(&mut self, name: &str) -> Option<String> {
        std::fs::read_to_string(self.dir.join(format!("{name}.em"))).ok()
    }
}

#[test]
fn test_module_loading_from_files() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("mathx.em"),
        "func square(x) { return x * x; }",
    )
    .unwrap();

    let mut vm = Vm::new(VmParams::new().with_host(Box::new(FileHost {
        dir: dir.path().to_path_buf(),
    })));
    vm.execute_in_module(
        Some("main"),
        "import \"mathx\" for square; var r = square(9);",
    )
    .unwrap();
    vm.module_variable(0, "r", 0).unwrap();
    assert_eq!(vm.slot_number(0).unwrap(), 81.0);
}

#[test]
fn test_stdlib_is_idempotent() {
    let (mut vm, captured) = recording_vm();
    vm.load_stdlib(StdModules::IO).unwrap();
    vm.load_stdlib(StdModules::IO).unwrap();
    vm.execute_in_module(Some("t"), "import \"std:io\" for print; print(1);")
        .unwrap();
    assert_eq!(captured.borrow().printed(), "1\n");
}
