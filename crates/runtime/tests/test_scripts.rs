//! End-to-end language tests: source in, observable behavior out.

mod common;

use common::{recording_vm, recording_vm_with_modules, run_and_read_number};
use ember_runtime::{ErrorCode, StdModules, ValueType};

#[test]
fn test_arithmetic_and_print() {
    let (mut vm, captured) = recording_vm();
    vm.load_stdlib(StdModules::IO).unwrap();
    vm.execute_in_module(
        Some("main"),
        "import \"std:io\" for print; print(1 + 2 * 3);",
    )
    .unwrap();
    assert_eq!(captured.borrow().printed(), "7\n");
}

#[test]
fn test_host_invokes_fib() {
    let (mut vm, _) = recording_vm();
    vm.execute_in_module(
        Some("main"),
        "func fib(n) { if (n < 2) { return n; } return fib(n-1) + fib(n-2); }",
    )
    .unwrap();
    // Module is in slot 0; fetch fib into slot 0 and call it with 9.
    vm.module_variable(0, "fib", 0).unwrap();
    assert_eq!(vm.slot_type(0).unwrap(), ValueType::Function);
    assert_eq!(vm.slot_arity(0).unwrap(), 1);
    vm.set_slot_number(1, 9.0);
    vm.call(1).unwrap();
    assert_eq!(vm.slot_number(0).unwrap(), 34.0);
}

#[test]
fn test_for_loop_with_break() {
    let (mut vm, _) = recording_vm();
    let s = run_and_read_number(
        &mut vm,
        "var s = 0;\n\
         for (var i = 0; i < 100; i = i + 1) {\n\
             if (i == 5) { break; }\n\
             s = s + i;\n\
         }",
        "s",
    );
    assert_eq!(s, 10.0);
}

#[test]
fn test_classes_inheritance_and_super() {
    let (mut vm, _) = recording_vm();
    let r = run_and_read_number(
        &mut vm,
        "class A { func speak() { return 1; } }\n\
         class B : A { func speak() { return super.speak() + 2; } }\n\
         var b = new B();\n\
         var result = b.speak();",
        "result",
    );
    assert_eq!(r, 3.0);
}

#[test]
fn test_string_concatenation_via_add() {
    let (mut vm, _) = recording_vm();
    vm.execute_in_module(Some("t"), "var s = \"n=\" + 2;").unwrap();
    vm.module_variable(0, "s", 0).unwrap();
    assert_eq!(vm.slot_string(0).unwrap(), "n=2");
    assert_eq!(vm.slot_string(0).unwrap().as_bytes(), b"n=2");
}

#[test]
fn test_while_loop() {
    let (mut vm, _) = recording_vm();
    let n = run_and_read_number(
        &mut vm,
        "var n = 1; while (n < 100) { n = n * 2; }",
        "n",
    );
    assert_eq!(n, 128.0);
}

#[test]
fn test_operators() {
    let (mut vm, _) = recording_vm();
    assert_eq!(
        run_and_read_number(&mut vm, "var r = 17 % 5;", "r"),
        2.0
    );
    let (mut vm, _) = recording_vm();
    assert_eq!(
        run_and_read_number(&mut vm, "var r = 2 ** 10;", "r"),
        1024.0
    );
    let (mut vm, _) = recording_vm();
    assert_eq!(run_and_read_number(&mut vm, "var r = -(3) + 5;", "r"), 2.0);
    let (mut vm, _) = recording_vm();
    assert_eq!(
        run_and_read_number(&mut vm, "var r = (1 < 2) ? 10 : 20;", "r"),
        10.0
    );
    let (mut vm, _) = recording_vm();
    // Logical operators evaluate both sides and return a boolean.
    assert_eq!(
        run_and_read_number(
            &mut vm,
            "var r = 0; if (true && 0) { r = 1; } else { r = 2; }",
            "r"
        ),
        1.0,
        "zero is truthy"
    );
}

#[test]
fn test_compound_assignment() {
    let (mut vm, _) = recording_vm();
    let r = run_and_read_number(
        &mut vm,
        "var r = 10; { var x = 1; x += 4; r += x; } r -= 2;",
        "r",
    );
    assert_eq!(r, 13.0);
}

#[test]
fn test_string_equality_is_by_content() {
    let (mut vm, _) = recording_vm();
    let r = run_and_read_number(
        &mut vm,
        "var r = 0; if (\"ab\" == \"a\" + \"b\") { r = 1; }",
        "r",
    );
    assert_eq!(r, 1.0);
}

#[test]
fn test_false_is_not_nil() {
    let (mut vm, _) = recording_vm();
    let r = run_and_read_number(
        &mut vm,
        "var r = 0; if (false == nil) { r = 1; } else { r = 2; }",
        "r",
    );
    assert_eq!(r, 2.0);
}

#[test]
fn test_instance_fields_and_ctor() {
    let (mut vm, _) = recording_vm();
    let r = run_and_read_number(
        &mut vm,
        "class P {\n\
             var x = 1;\n\
             var y = 2;\n\
             func ctor(v) { self.x = v; }\n\
             func sum() { return self.x + self.y; }\n\
         }\n\
         var p = new P(40);\n\
         var r = p.sum();",
        "r",
    );
    assert_eq!(r, 42.0);
}

#[test]
fn test_new_without_ctor() {
    let (mut vm, _) = recording_vm();
    let r = run_and_read_number(
        &mut vm,
        "class Q { var v = 7; } var a = new Q; var b = new Q(); var r = a.v + b.v;",
        "r",
    );
    assert_eq!(r, 14.0);
}

#[test]
fn test_field_initializers_are_per_instance() {
    let (mut vm, _) = recording_vm();
    let r = run_and_read_number(
        &mut vm,
        "class C { var n = 1; }\n\
         var a = new C();\n\
         var b = new C();\n\
         a.n = 50;\n\
         var r = a.n + b.n;",
        "r",
    );
    assert_eq!(r, 51.0);
}

#[test]
fn test_static_members() {
    let (mut vm, _) = recording_vm();
    let r = run_and_read_number(
        &mut vm,
        "class M {\n\
             static var k = 3;\n\
             static func bump() { return M.k + 1; }\n\
         }\n\
         var r = M.bump() + M.k;",
        "r",
    );
    assert_eq!(r, 7.0);
}

#[test]
fn test_method_forward_reference_within_class() {
    let (mut vm, _) = recording_vm();
    let r = run_and_read_number(
        &mut vm,
        "class F {\n\
             func a() { return self.b() + 1; }\n\
             func b() { return 10; }\n\
         }\n\
         var r = new F().a();",
        "r",
    );
    assert_eq!(r, 11.0);
}

#[test]
fn test_inherited_method_lookup() {
    let (mut vm, _) = recording_vm();
    let r = run_and_read_number(
        &mut vm,
        "class A { func base() { return 5; } }\n\
         class B : A { }\n\
         var r = new B().base();",
        "r",
    );
    assert_eq!(r, 5.0);
}

#[test]
fn test_operator_overloading_index_and_call() {
    let (mut vm, _) = recording_vm();
    let r = run_and_read_number(
        &mut vm,
        "class V {\n\
             var last = 0;\n\
             func [](i) { return i * 2; }\n\
             func []=(i, v) { self.last = i + v; }\n\
             func call(x) { return x + 1; }\n\
         }\n\
         var v = new V();\n\
         var a = v[3];\n\
         v[1] = 9;\n\
         var b = v.last;\n\
         var c = v(4);\n\
         var r = a + b + c;",
        "r",
    );
    // a = 6, b = 10, c = 5.
    assert_eq!(r, 21.0);
}

#[test]
fn test_import_with_for_list_and_renames() {
    let (mut vm, _) = recording_vm_with_modules(&[(
        "util",
        "func double(x) { return x + x; } func triple(x) { return x * 3; }",
    )]);
    let r = run_and_read_number(
        &mut vm,
        "import \"util\" for double as twice, triple;\n\
         var r = twice(10) + triple(10);",
        "r",
    );
    assert_eq!(r, 50.0);
}

#[test]
fn test_import_all_copies_declared_functions() {
    let (mut vm, _) = recording_vm_with_modules(&[(
        "util",
        "func id(x) { return x; } var pending = 1;",
    )]);
    let r = run_and_read_number(&mut vm, "import \"util\"; var r = id(6);", "r");
    assert_eq!(r, 6.0);
}

#[test]
fn test_import_missing_module_is_a_compile_error() {
    let (mut vm, captured) = recording_vm();
    let err = vm
        .execute_in_module(Some("m"), "import \"nothere\";")
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Compile);
    assert!(err.message.contains("not found"));
    assert!(
        captured
            .borrow()
            .error_codes()
            .contains(&ErrorCode::Compile)
    );
}

#[test]
fn test_import_is_idempotent_through_registry() {
    let (mut vm, _) = recording_vm_with_modules(&[("util", "func one() { return 1; }")]);
    vm.execute_in_module(Some("a"), "import \"util\" for one; var r = one();")
        .unwrap();
    // Second import must hit the registry, not recompile.
    vm.execute_in_module(Some("b"), "import \"util\" for one; var r = one();")
        .unwrap();
}

#[test]
fn test_modulo_and_comparisons_in_loop() {
    let (mut vm, _) = recording_vm();
    let r = run_and_read_number(
        &mut vm,
        "var r = 0;\n\
         for (var i = 1; i <= 10; i = i + 1) {\n\
             if (i % 2 == 0) { r = r + i; }\n\
         }",
        "r",
    );
    assert_eq!(r, 30.0);
}

#[test]
fn test_nested_function_declaration() {
    let (mut vm, _) = recording_vm();
    let r = run_and_read_number(
        &mut vm,
        "func outer(x) {\n\
             func inner(y) { return y * 2; }\n\
             return inner(x) + 1;\n\
         }\n\
         var r = outer(5);",
        "r",
    );
    assert_eq!(r, 11.0);
}

#[test]
fn test_variadic_print_joins_arguments() {
    let (mut vm, captured) = recording_vm();
    vm.load_stdlib(StdModules::IO).unwrap();
    vm.execute_in_module(
        Some("main"),
        "import \"std:io\" for print; print(\"x\", 1, true, nil);",
    )
    .unwrap();
    assert_eq!(captured.borrow().printed(), "x 1 true nil\n");
}
