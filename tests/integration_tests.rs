// Integration tests for the Ember bytecode interpreter.
//
// These run complete Ember programs through the compiled `ember` binary and
// assert on its captured stdout/stderr and exit code, exercising the public
// compile-and-execute pipeline end to end rather than any internal module.

use std::io::Write;
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};

fn unique_script_path(prefix: &str) -> std::path::PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    let id = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("ember_test_{prefix}_{id}.ember"))
}

struct RunOutput {
    stdout: String,
    stderr: String,
    code: i32,
}

fn run_source(source: &str) -> RunOutput {
    let path = unique_script_path("run");
    {
        let mut f = std::fs::File::create(&path).expect("create temp script");
        f.write_all(source.as_bytes()).expect("write temp script");
    }

    let output = Command::new(env!("CARGO_BIN_EXE_ember"))
        .arg(&path)
        .output()
        .expect("run ember binary");

    let _ = std::fs::remove_file(&path);

    RunOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        code: output.status.code().unwrap_or(-1),
    }
}

#[test]
fn arithmetic_precedence() {
    let out = run_source("print 1 + 2 * 3;");
    assert_eq!(out.stdout, "7\n");
    assert_eq!(out.code, 0);
}

#[test]
fn string_concatenation() {
    let out = run_source(r#"var a = "st"; var b = "r"; print a + b + "ing";"#);
    assert_eq!(out.stdout, "string\n");
}

#[test]
fn closures_capture_by_reference() {
    let out = run_source(
        "fun make(x){ fun g(){ return x; } return g; } var f = make(42); print f();",
    );
    assert_eq!(out.stdout, "42\n");
}

#[test]
fn inheritance_super_and_init() {
    let out = run_source(
        "class A{ init(n){ this.n = n; } } \
         class B < A { init(n){ super.init(n); this.n = this.n + 1; } } \
         print B(10).n;",
    );
    assert_eq!(out.stdout, "11\n");
}

#[test]
fn for_loop_accumulation() {
    let out = run_source("var x = 0; for (var i = 0; i < 3; i = i + 1) x = x + i; print x;");
    assert_eq!(out.stdout, "3\n");
}

#[test]
fn per_iteration_closure_capture_observes_final_value() {
    let out = run_source(
        "fun make(){ var c; for (var i = 0; i < 3; i = i + 1) { fun g(){ return i; } c = g; } return c; } \
         print make()();",
    );
    assert_eq!(out.stdout, "3\n");
}

#[test]
fn short_circuit_and_or_skip_the_right_operand() {
    let out = run_source(
        r#"
        fun sideEffect() { print "evaluated"; return true; }
        if (false and sideEffect()) {}
        if (true or sideEffect()) {}
        print "done";
        "#,
    );
    assert_eq!(out.stdout, "done\n");
}

#[test]
fn init_without_return_value_yields_the_instance() {
    let out = run_source(
        "class Point { init(x, y) { this.x = x; this.y = y; return; } } \
         var p = Point(1, 2); print p.x; print p.y;",
    );
    assert_eq!(out.stdout, "1\n2\n");
}

#[test]
fn returning_a_value_from_init_is_a_compile_error() {
    let out = run_source("class A { init() { return 1; } }");
    assert_ne!(out.code, 0);
    assert!(out.stderr.contains("Error"));
}

#[test]
fn shadowing_a_variable_with_its_own_initializer_is_a_compile_error() {
    let out = run_source("{ var a = 1; var a = a; }");
    assert_ne!(out.code, 0);
    assert!(out.stderr.contains("Error"));
}

#[test]
fn field_shadows_method_on_invoke_fast_path() {
    let out = run_source(
        "class Box { greet() { return \"method\"; } } \
         fun fieldGreet() { return \"field\"; } \
         var b = Box(); \
         b.greet = fieldGreet; \
         print b.greet();",
    );
    assert_eq!(out.stdout, "field\n");
}

#[test]
fn undefined_variable_read_is_a_runtime_error() {
    let out = run_source("print undefined_thing;");
    assert_ne!(out.code, 0);
    assert!(out.stderr.contains("Undefined variable"));
}

#[test]
fn calling_a_non_callable_is_a_runtime_error() {
    let out = run_source("var x = 1; x();");
    assert_ne!(out.code, 0);
    assert!(out.stderr.contains("Can only call functions and classes"));
}

#[test]
fn wrong_argument_count_is_a_runtime_error() {
    let out = run_source("fun f(a, b) { return a + b; } f(1);");
    assert_ne!(out.code, 0);
    assert!(out.stderr.contains("Expected 2 arguments but got 1"));
}

#[test]
fn inheriting_from_a_non_class_is_a_runtime_error() {
    let out = run_source("var NotAClass = 1; class A < NotAClass {}");
    assert_ne!(out.code, 0);
    assert!(out.stderr.contains("Superclass must be a class"));
}

#[test]
fn deep_recursion_overflows_the_frame_stack() {
    let out = run_source("fun rec(n) { return rec(n + 1); } rec(0);");
    assert_ne!(out.code, 0);
    assert!(out.stderr.contains("Stack overflow"));
}

#[test]
fn stress_gc_produces_identical_output_to_normal_collection() {
    let source = r#"
        class Node {
            init(value, next) {
                this.value = value;
                this.next = next;
            }
        }
        fun build(n) {
            var head = nil;
            for (var i = 0; i < n; i = i + 1) {
                head = Node(i, head);
            }
            return head;
        }
        var list = build(50);
        var sum = 0;
        while (list != nil) {
            sum = sum + list.value;
            list = list.next;
        }
        print sum;
    "#;

    let path = unique_script_path("stress");
    std::fs::File::create(&path)
        .unwrap()
        .write_all(source.as_bytes())
        .unwrap();

    let normal = Command::new(env!("CARGO_BIN_EXE_ember"))
        .arg(&path)
        .output()
        .expect("run normally");
    let stressed = Command::new(env!("CARGO_BIN_EXE_ember"))
        .arg(&path)
        .arg("--stress-gc")
        .output()
        .expect("run under stress-gc");

    let _ = std::fs::remove_file(&path);

    assert_eq!(
        String::from_utf8_lossy(&normal.stdout),
        String::from_utf8_lossy(&stressed.stdout)
    );
}

#[test]
fn file_not_found_exits_with_os_error_code() {
    let output = Command::new(env!("CARGO_BIN_EXE_ember"))
        .arg("/nonexistent/path/does_not_exist.ember")
        .output()
        .expect("run ember binary");
    assert_eq!(output.status.code(), Some(74));
}
