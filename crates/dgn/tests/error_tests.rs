use dgn::{Error, Interpreter, MemoryLoader};
use pretty_assertions::assert_eq;

fn run(source: &str) -> Vec<String> {
    let mut interp = Interpreter::new(".");
    interp.run(source).expect("script should run");
    interp.take_output()
}

fn run_err(source: &str) -> Error {
    let mut interp = Interpreter::new(".");
    interp.run(source).expect_err("script should fail")
}

// ---------------------------------------------------------------------------
// Catchable runtime exceptions
// ---------------------------------------------------------------------------

#[test]
fn thrown_exceptions_carry_their_message() {
    assert_eq!(
        run("try { throw TypeException(\"boom\"); } catch (e) { print(e.message); }"),
        vec!["boom"]
    );
}

#[test]
fn catch_without_binding_discards_the_exception() {
    assert_eq!(
        run("try { throw TypeException(\"x\"); } catch { print(\"caught\"); }"),
        vec!["caught"]
    );
}

#[test]
fn finally_runs_after_catch() {
    assert_eq!(
        run("try { throw TypeException(\"t\"); } catch { print(\"c\"); } finally { print(\"f\"); }"),
        vec!["c", "f"]
    );
    assert_eq!(
        run("try { print(\"ok\"); } catch { print(\"c\"); } finally { print(\"f\"); }"),
        vec!["ok", "f"]
    );
}

#[test]
fn exceptions_unwind_into_the_caller() {
    let source = r#"
        function boom() { throw IndexException("deep"); }
        try { boom(); } catch (e) { print(e.message); }
        print("after");
    "#;
    assert_eq!(run(source), vec!["deep", "after"]);
}

#[test]
fn inner_try_catches_before_outer() {
    let source = r#"
        try {
            try { throw TypeException("inner"); } catch (e) { print("caught " + e.message); }
        } catch (e) {
            print("outer");
        }
    "#;
    assert_eq!(run(source), vec!["caught inner"]);
}

#[test]
fn stack_trace_lists_unwound_frames() {
    let source = r#"
        function deep() { throw TypeException("t"); }
        function mid() { return deep(); }
        try { mid(); } catch (e) {
            print(e.stackTrace.length());
            print(typeof e.stackTrace);
        }
    "#;
    assert_eq!(run(source), vec!["2", "list"]);
}

#[test]
fn locals_survive_a_caught_exception() {
    let source = r#"
        var kept = "before";
        try { throw TypeException("x"); } catch { }
        print(kept);
    "#;
    assert_eq!(run(source), vec!["before"]);
}

#[test]
fn operator_misuse_raises_type_exceptions() {
    assert_eq!(
        run("try { 1 + null; } catch (e) { print(e instanceof TypeException); }"),
        vec!["true"]
    );
    assert_eq!(
        run("try { -\"s\"; } catch (e) { print(e instanceof TypeException); }"),
        vec!["true"]
    );
    assert_eq!(
        run("try { 1 << 0.5; } catch (e) { print(e instanceof TypeException); }"),
        vec!["true"]
    );
    assert_eq!(
        run("try { 1 << (0 - 1); } catch (e) { print(e instanceof TypeException); }"),
        vec!["true"]
    );
    assert_eq!(
        run("try { 1.5..3; } catch (e) { print(e instanceof TypeException); }"),
        vec!["true"]
    );
}

#[test]
fn field_access_on_non_instances_raises() {
    assert_eq!(
        run("try { 5.foo; } catch (e) { print(e instanceof TypeException); }"),
        vec!["true"]
    );
    assert_eq!(
        run("try { true[0]; } catch (e) { print(e instanceof TypeException); }"),
        vec!["true"]
    );
}

#[test]
fn out_of_range_index_raises() {
    assert_eq!(
        run("try { [1][5]; } catch (e) { print(e instanceof IndexException); }"),
        vec!["true"]
    );
    assert_eq!(
        run("try { [1][-2]; } catch (e) { print(e instanceof IndexException); }"),
        vec!["true"]
    );
    assert_eq!(
        run("try { [].pop(); } catch (e) { print(e instanceof IndexException); }"),
        vec!["true"]
    );
}

#[test]
fn undefined_variables_raise() {
    assert_eq!(
        run("try { missing; } catch (e) { print(e instanceof UndefinedVariableException); }"),
        vec!["true"]
    );
    assert_eq!(
        run("try { missing = 1; } catch (e) { print(e instanceof UndefinedVariableException); }"),
        vec!["true"]
    );
}

#[test]
fn missing_properties_raise() {
    assert_eq!(
        run("class A { } try { A().nope; } catch (e) { print(e instanceof PropertyException); }"),
        vec!["true"]
    );
    assert_eq!(
        run("try { [].nope(); } catch (e) { print(e instanceof PropertyException); }"),
        vec!["true"]
    );
}

#[test]
fn wrong_arity_raises() {
    assert_eq!(
        run("function g(a) { } try { g(1, 2); } catch (e) { print(e instanceof ArityException); }"),
        vec!["true"]
    );
    assert_eq!(
        run("function g(a) { } try { g(); } catch (e) { print(e.message); }"),
        vec!["Expected 1 arguments but got 0."]
    );
    assert_eq!(
        run("class A { } try { A(1); } catch (e) { print(e instanceof ArityException); }"),
        vec!["true"]
    );
}

#[test]
fn calling_a_non_callable_raises() {
    assert_eq!(
        run("try { 5(); } catch (e) { print(e instanceof TypeException); }"),
        vec!["true"]
    );
}

#[test]
fn throwing_a_non_exception_raises_type() {
    assert_eq!(
        run("try { throw 5; } catch (e) { print(e instanceof TypeException); }"),
        vec!["true"]
    );
}

#[test]
fn deep_recursion_raises_stack_overflow() {
    let source = r#"
        function f() { return f(); }
        try { f(); } catch (e) { print(e instanceof StackOverflowException); }
        print("recovered");
    "#;
    assert_eq!(run(source), vec!["true", "recovered"]);
}

#[test]
fn exceptions_are_instances_of_the_hierarchy() {
    let source = r#"
        try { [1][9]; } catch (e) {
            print(e instanceof IndexException);
            print(e instanceof Exception);
            print(e instanceof Object);
            print(typeof e);
        }
    "#;
    assert_eq!(run(source), vec!["true", "true", "true", "instance"]);
}

#[test]
fn user_exception_subclasses_are_catchable() {
    let source = r#"
        class ParseError : Exception { }
        try { throw ParseError("bad input"); } catch (e) {
            print(e instanceof ParseError);
            print(e instanceof Exception);
            print(e.message);
        }
    "#;
    assert_eq!(run(source), vec!["true", "true", "bad input"]);
}

#[test]
fn native_failures_are_catchable_exceptions() {
    assert_eq!(
        run("try { sqrt(\"x\"); } catch (e) { print(e instanceof TypeException); }"),
        vec!["true"]
    );
    assert_eq!(
        run("try { \"ab\".repeat(0 - 1); } catch (e) { print(e instanceof TypeException); }"),
        vec!["true"]
    );
    assert_eq!(
        run("try { [].ofLength(\"three\"); } catch (e) { print(e instanceof TypeException); }"),
        vec!["true"]
    );
}

#[test]
fn to_string_must_return_a_string() {
    let source = r#"
        class Bad { toString() { return 5; } }
        try { print(Bad()); } catch (e) { print(e.message); }
    "#;
    assert_eq!(run(source), vec!["toString must return a string."]);
}

#[test]
fn exception_thrown_inside_a_map_callback_unwinds_the_native() {
    let source = r#"
        try {
            [1, 2, 3].map(|x| {
                if (x == 2) { throw TypeException("mid-map"); }
                return x;
            });
        } catch (e) {
            print(e.message);
        }
        print("after");
    "#;
    assert_eq!(run(source), vec!["mid-map", "after"]);
}

#[test]
fn stack_trace_lines_name_function_and_line() {
    assert_eq!(
        run("function f() { throw TypeException(\"x\"); } try { f(); } catch (e) { print(e.stackTrace[0]); }"),
        vec!["[line 1] in f()"]
    );
}

// ---------------------------------------------------------------------------
// Non-catchable failures
// ---------------------------------------------------------------------------

#[test]
fn uncaught_exceptions_end_the_run() {
    let err = run_err("throw TypeException(\"nobody home\");");
    match &err {
        Error::Runtime { message, trace } => {
            assert!(message.contains("TypeException: nobody home"), "{message}");
            assert!(!trace.is_empty());
        }
        other => panic!("expected a runtime error, got {other:?}"),
    }
    assert_eq!(err.exit_code(), 122);
}

#[test]
fn repeated_frames_collapse_in_the_trace() {
    let source = r#"
        function f(n) {
            if (n == 0) { throw TypeException("bottom"); }
            return f(n - 1);
        }
        f(5);
    "#;
    let err = run_err(source);
    match err {
        Error::Runtime { trace, .. } => {
            assert!(
                trace.iter().any(|line| line.contains("[Previous ×")),
                "{trace:?}"
            );
        }
        other => panic!("expected a runtime error, got {other:?}"),
    }
}

#[test]
fn compile_errors_are_reported_with_location() {
    let err = run_err("var = 1;");
    match &err {
        Error::Compile(diagnostics) => {
            assert!(diagnostics[0].starts_with("[1] Error at '='"), "{diagnostics:?}");
        }
        other => panic!("expected a compile error, got {other:?}"),
    }
    assert_eq!(err.exit_code(), 121);
}

#[test]
fn unterminated_string_is_a_compile_error() {
    let err = run_err("var s = \"oops");
    assert!(matches!(err, Error::Compile(_)));
}

#[test]
fn interpreter_survives_failed_runs() {
    let mut interp = Interpreter::new(".");
    assert!(interp.run("throw TypeException(\"x\");").is_err());
    interp.run("print(\"still alive\");").unwrap();
    assert_eq!(interp.take_output(), vec!["still alive"]);
}

// ---------------------------------------------------------------------------
// Imports
// ---------------------------------------------------------------------------

#[test]
fn missing_import_file_is_fatal() {
    let mut interp = Interpreter::with_loader("", Box::new(MemoryLoader::new()));
    let err = interp
        .run("var m = import \"nowhere\";")
        .expect_err("import should fail");
    assert!(matches!(err, Error::File { .. }));
    assert_eq!(err.exit_code(), 120);
}

#[test]
fn exception_in_imported_module_propagates_to_importer() {
    let mut loader = MemoryLoader::new();
    loader.add("bad.dgn", "throw TypeException(\"module boom\");");
    let mut interp = Interpreter::with_loader("", Box::new(loader));
    interp
        .run("try { var m = import \"bad\"; } catch (e) { print(e.message); }")
        .unwrap();
    assert_eq!(interp.take_output(), vec!["module boom"]);
}

#[test]
fn compile_error_in_imported_module_is_fatal() {
    let mut loader = MemoryLoader::new();
    loader.add("broken.dgn", "var = ;");
    let mut interp = Interpreter::with_loader("", Box::new(loader));
    let err = interp
        .run("var m = import \"broken\";")
        .expect_err("import should fail");
    assert!(matches!(err, Error::Compile(_)));
}
