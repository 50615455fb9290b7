//! Collector behavior: rooting, finalization ordering, reclamation.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};

use common::recording_vm;
use ember_runtime::{ClassBinding, StdModules, Vm, VmParams};

#[test]
fn test_unreachable_objects_are_reclaimed() {
    let (mut vm, _) = recording_vm();
    vm.execute_in_module(Some("t"), "var keep = \"kept\"; { var drop = \"n=\" + 1; }")
        .unwrap();
    vm.collect_garbage();
    // The kept string is still readable through the module.
    vm.module_variable(0, "keep", 0).unwrap();
    assert_eq!(vm.slot_string(0).unwrap(), "kept");
}

static NATIVE_FINALIZED: AtomicUsize = AtomicUsize::new(0);

fn native_finalizer(_data: &mut [u8]) {
    NATIVE_FINALIZED.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn test_native_finalizer_runs_exactly_once() {
    let (mut vm, _) = recording_vm();
    vm.make_module(0, "native").unwrap();
    vm.bind_class(
        0,
        ClassBinding::new("Native")
            .with_extra_size(8)
            .with_finalizer(native_finalizer),
    )
    .unwrap();

    vm.execute_in_module(
        Some("t"),
        "import \"native\" for Native; { var x = new Native; }",
    )
    .unwrap();

    let before = NATIVE_FINALIZED.load(Ordering::SeqCst);
    vm.collect_garbage();
    assert_eq!(
        NATIVE_FINALIZED.load(Ordering::SeqCst),
        before + 1,
        "finalizer must run on the first collection after death"
    );
    vm.collect_garbage();
    assert_eq!(
        NATIVE_FINALIZED.load(Ordering::SeqCst),
        before + 1,
        "a second collection must not finalize again"
    );
}

static HANDLE_FINALIZED: AtomicUsize = AtomicUsize::new(0);

fn handle_finalizer(_data: &mut [u8]) {
    HANDLE_FINALIZED.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn test_handles_root_values_until_destroyed() {
    let (mut vm, _) = recording_vm();
    vm.make_module(0, "native").unwrap();
    vm.bind_class(
        0,
        ClassBinding::new("Native").with_finalizer(handle_finalizer),
    )
    .unwrap();
    vm.execute_in_module(Some("t"), "import \"native\" for Native; var x = new Native;")
        .unwrap();
    vm.module_variable(0, "x", 0).unwrap();
    let handle = vm.make_handle(0).unwrap();

    // Drop every other path to the instance: the module that held `x`
    // leaves the registry, and the slot is cleared.
    vm.unload_module("t").unwrap();
    vm.set_slot_nil(0);
    vm.collect_garbage();
    assert_eq!(HANDLE_FINALIZED.load(Ordering::SeqCst), 0);

    // The handle still loads the live instance.
    vm.load_handle(handle, 0).unwrap();
    assert_eq!(
        vm.slot_type(0).unwrap(),
        ember_runtime::ValueType::Instance
    );

    vm.set_slot_nil(0);
    vm.destroy_handle(handle);
    vm.collect_garbage();
    assert_eq!(HANDLE_FINALIZED.load(Ordering::SeqCst), 1);
}

#[test]
fn test_script_dtor_runs_once_before_reclamation() {
    let (mut vm, captured) = recording_vm();
    vm.load_stdlib(StdModules::IO).unwrap();
    vm.execute_in_module(
        Some("t"),
        "import \"std:io\" for print;\n\
         class D {\n\
             func dtor() { print(\"bye\"); }\n\
         }\n\
         { var x = new D(); }",
    )
    .unwrap();
    vm.collect_garbage();
    assert_eq!(captured.borrow().printed(), "bye\n");
    // The object is freed by the following sweep without running dtor
    // again.
    vm.collect_garbage();
    vm.collect_garbage();
    assert_eq!(captured.borrow().printed(), "bye\n");
}

#[test]
fn test_collection_during_execution_is_safe() {
    // A tiny heap forces collection cycles while the loop allocates fresh
    // strings; everything reachable must survive.
    let mut vm = Vm::new(
        VmParams::new()
            .with_min_heap_size(512)
            .with_initial_heap_size(512),
    );
    vm.execute_in_module(
        Some("t"),
        "var s = \"\";\n\
         for (var i = 0; i < 200; i = i + 1) { s = s + \"x\"; }\n\
         var r = 0;\n\
         if (s == s + \"\") { r = 1; }",
    )
    .unwrap();
    vm.module_variable(0, "r", 0).unwrap();
    assert_eq!(vm.slot_number(0).unwrap(), 1.0);
}

#[test]
fn test_unloaded_module_objects_are_collected() {
    static DEAD: AtomicUsize = AtomicUsize::new(0);
    fn fin(_d: &mut [u8]) {
        DEAD.fetch_add(1, Ordering::SeqCst);
    }

    let (mut vm, _) = recording_vm();
    vm.make_module(0, "native").unwrap();
    vm.bind_class(0, ClassBinding::new("Native").with_finalizer(fin))
        .unwrap();
    vm.execute_in_module(Some("t"), "import \"native\" for Native; var x = new Native;")
        .unwrap();
    vm.set_slot_nil(0);
    vm.collect_garbage();
    // Still rooted through module 't'.
    assert_eq!(DEAD.load(Ordering::SeqCst), 0);

    vm.unload_module("t").unwrap();
    vm.collect_garbage();
    assert_eq!(DEAD.load(Ordering::SeqCst), 1);
}
