use dgn::{Interpreter, MemoryLoader};
use pretty_assertions::assert_eq;

/// Run a script and return its captured print output.
fn run(source: &str) -> Vec<String> {
    let mut interp = Interpreter::new(".");
    interp.run(source).expect("script should run");
    interp.take_output()
}

#[test]
fn arithmetic_and_printing() {
    assert_eq!(run("print(1 + 2 * 3);"), vec!["7"]);
    assert_eq!(run("print(10 / 4);"), vec!["2.5"]);
    assert_eq!(run("print(10 % 3);"), vec!["1"]);
    assert_eq!(run("print(-(3));"), vec!["-3"]);
    assert_eq!(run("print(1, \"two\", 3);"), vec!["1 two 3"]);
}

#[test]
fn comparison_and_logic() {
    assert_eq!(run("print(1 < 2 && 2 <= 2);"), vec!["true"]);
    assert_eq!(run("print(1 > 2 || 3 >= 4);"), vec!["false"]);
    assert_eq!(run("print(!false);"), vec!["true"]);
    // Short-circuit keeps the deciding operand as the result.
    assert_eq!(run("print(null || \"fallback\");"), vec!["fallback"]);
    assert_eq!(run("print(false && missing());"), vec!["false"]);
}

#[test]
fn bitwise_operators() {
    assert_eq!(run("print(6 & 3);"), vec!["2"]);
    assert_eq!(run("print(6 | 3);"), vec!["7"]);
    assert_eq!(run("print(6 ^ 3);"), vec!["5"]);
    assert_eq!(run("print(1 << 4);"), vec!["16"]);
    assert_eq!(run("print(-8 >> 1);"), vec!["-4"]);
    assert_eq!(run("print(~0);"), vec!["-1"]);
    // Logical shift reinterprets the operand as unsigned.
    assert_eq!(run("print((0 - 1) >>> 32 > 0);"), vec!["true"]);
}

#[test]
fn variables_and_compound_assignment() {
    assert_eq!(run("var a = 1; a += 4; print(a);"), vec!["5"]);
    assert_eq!(run("var a = 8; a >>= 2; print(a);"), vec!["2"]);
    assert_eq!(run("var a = 2; a *= 3; print(a);"), vec!["6"]);
    assert_eq!(
        run("var l = [1, 2, 3]; l[1] += 10; print(l[1]);"),
        vec!["12"]
    );
    assert_eq!(
        run("var o = { n: 1 }; o.n += 2; print(o.n);"),
        vec!["3"]
    );
}

#[test]
fn ternary_and_pipe() {
    assert_eq!(run("print(1 == 2 ? \"a\" : \"b\");"), vec!["b"]);
    assert_eq!(
        run("function double(x) { return x * 2; } print(5 |> double);"),
        vec!["10"]
    );
    assert_eq!(
        run("function inc(x) { return x + 1; } function double(x) { return x * 2; } print(3 |> inc |> double);"),
        vec!["8"]
    );
}

#[test]
fn strings_and_concatenation() {
    assert_eq!(run("print(\"foo\" + \"bar\");"), vec!["foobar"]);
    assert_eq!(run("print(\"n = \" + 42);"), vec!["n = 42"]);
    assert_eq!(run("print(1 + \"!\");"), vec!["1!"]);
    assert_eq!(run("print('single' + \"double\");"), vec!["singledouble"]);
    assert_eq!(run(r#"print("tab\there");"#), vec!["tab\there"]);
}

#[test]
fn interned_strings_share_identity() {
    assert_eq!(run("print(\"ab\" is \"a\" + \"b\");"), vec!["true"]);
}

#[test]
fn list_literals_and_indexing() {
    assert_eq!(run("print([1, 2, 3]);"), vec!["[1, 2, 3]"]);
    assert_eq!(run("var l = [1, 2, 3]; print(l[0] + l[2]);"), vec!["4"]);
    assert_eq!(run("var l = [1, 2, 3]; print(l[-1]);"), vec!["3"]);
    assert_eq!(run("var l = [1, 2, 3]; l[0] = 9; print(l);"), vec!["[9, 2, 3]"]);
    assert_eq!(run("print([\"a\"]);"), vec!["[\"a\"]"]);
}

#[test]
fn list_equality_is_elementwise() {
    assert_eq!(run("print([1, [2]] == [1, [2]]);"), vec!["true"]);
    assert_eq!(run("print([1] == [2]);"), vec!["false"]);
    // `is` stays identity for lists.
    assert_eq!(run("print([1] is [1]);"), vec!["false"]);
    assert_eq!(run("var l = [1]; print(l is l);"), vec!["true"]);
}

#[test]
fn list_plus_appends() {
    assert_eq!(run("print([1, 2] + 3);"), vec!["[1, 2, 3]"]);
    // Appending a list nests it; `concat` is the flat version.
    assert_eq!(run("print([1] + [2]);"), vec!["[1, [2]]"]);
    assert_eq!(run("print([1].concat([2]));"), vec!["[1, 2]"]);
}

#[test]
fn ranges() {
    assert_eq!(run("print(1..5);"), vec!["[1, 2, 3, 4, 5]"]);
    assert_eq!(run("print(3..1);"), vec!["[3, 2, 1]"]);
    assert_eq!(run("print(2..2);"), vec!["[2]"]);
}

#[test]
fn if_else() {
    assert_eq!(
        run("if (1 < 2) print(\"yes\"); else print(\"no\");"),
        vec!["yes"]
    );
    assert_eq!(
        run("if (1 > 2) print(\"yes\"); else print(\"no\");"),
        vec!["no"]
    );
}

#[test]
fn while_with_break_and_continue() {
    let source = r#"
        var i = 0;
        var out = "";
        while (true) {
            i += 1;
            if (i == 2) continue;
            if (i > 4) break;
            out = out + i;
        }
        print(out);
    "#;
    assert_eq!(run(source), vec!["134"]);
}

#[test]
fn for_loop_builds_string() {
    assert_eq!(
        run("var s = \"\"; for (var i = 0; i < 3; i += 1) s = s + i; print(s);"),
        vec!["012"]
    );
}

#[test]
fn foreach_over_list_and_string() {
    assert_eq!(run("foreach (var x in [10, 20]) print(x);"), vec!["10", "20"]);
    assert_eq!(run("foreach (var c in \"ab\") print(c);"), vec!["a", "b"]);
}

#[test]
fn foreach_uses_the_iterator_protocol() {
    let source = r#"
        class CountTo {
            constructor(n) { this.n = n; this.i = 0; }
            iterator() { return this; }
            more() { return this.i < this.n; }
            next() { var v = this.i; this.i += 1; return v; }
        }
        foreach (var x in CountTo(2)) print(x);
    "#;
    assert_eq!(run(source), vec!["0", "1"]);
}

#[test]
fn functions_and_recursion() {
    assert_eq!(
        run("function fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); } print(fib(10));"),
        vec!["55"]
    );
}

#[test]
fn varargs_pack_surplus_arguments() {
    assert_eq!(
        run("function f(a, b...) { return b; } print(f(1, 2, 3, 4));"),
        vec!["[2, 3, 4]"]
    );
    assert_eq!(
        run("function f(a, b...) { return b; } print(f(1));"),
        vec!["[]"]
    );
}

#[test]
fn lambdas_have_lax_arity() {
    assert_eq!(run("var f = |a, b| [a, b]; print(f(1));"), vec!["[1, null]"]);
    assert_eq!(run("var f = |a, b| [a, b]; print(f(1, 2, 3));"), vec!["[1, 2]"]);
    assert_eq!(run("var f = || \"zero\"; print(f());"), vec!["zero"]);
}

#[test]
fn closures_capture_and_close_upvalues() {
    let source = r#"
        function makeCounter() {
            var n = 0;
            return || { n += 1; return n; };
        }
        var c = makeCounter();
        print(c());
        print(c());
    "#;
    assert_eq!(run(source), vec!["1", "2"]);
}

#[test]
fn closed_upvalue_holds_value_at_close() {
    let source = r#"
        function make() {
            var x = 1;
            var get = || x;
            x = 2;
            return get;
        }
        print(make()());
    "#;
    assert_eq!(run(source), vec!["2"]);
}

#[test]
fn block_exit_closes_captured_locals() {
    let source = r#"
        var get = null;
        {
            var x = 5;
            get = || x;
        }
        print(get());
    "#;
    assert_eq!(run(source), vec!["5"]);
}

#[test]
fn classes_constructors_and_to_string() {
    let source = r#"
        class A {
            constructor(x) { this.x = x; }
            toString() { return "A(" + this.x + ")"; }
        }
        print(A(7));
    "#;
    assert_eq!(run(source), vec!["A(7)"]);
}

#[test]
fn inheritance_and_super() {
    let source = r#"
        class A { greet() { return "A"; } }
        class B : A { greet() { return super.greet() + "B"; } }
        print(B().greet());
    "#;
    assert_eq!(run(source), vec!["AB"]);
}

#[test]
fn instanceof_walks_the_chain() {
    let source = r#"
        class A { }
        class B : A { }
        var b = B();
        print(b instanceof B);
        print(b instanceof A);
        print(b instanceof Object);
        print(A() instanceof B);
    "#;
    assert_eq!(run(source), vec!["true", "true", "true", "false"]);
}

#[test]
fn fields_shadow_methods() {
    let source = r#"
        class C { m() { return "method"; } }
        var c = C();
        print(c.m());
        c.m = || "field";
        print(c.m());
    "#;
    assert_eq!(run(source), vec!["method", "field"]);
}

#[test]
fn object_literals() {
    let source = r#"
        var c = 3;
        var o = { a: 1, "b": 2, c };
        print(o.a + o.b + o.c);
        print(o.hasProperty("a"));
        print(o.keys().length());
        print(o instanceof Object);
    "#;
    assert_eq!(run(source), vec!["6", "true", "3", "true"]);
}

#[test]
fn membership_operator() {
    assert_eq!(run("print(2 in [1, 2, 3]);"), vec!["true"]);
    assert_eq!(run("print(5 in [1, 2, 3]);"), vec!["false"]);
    assert_eq!(run("print(\"bc\" in \"abcd\");"), vec!["true"]);
    assert_eq!(run("var o = { a: 1 }; print(\"a\" in o);"), vec!["true"]);
    assert_eq!(run("var o = { a: 1 }; print(\"z\" in o);"), vec!["false"]);
}

#[test]
fn typeof_names() {
    assert_eq!(run("print(typeof 1);"), vec!["number"]);
    assert_eq!(run("print(typeof \"s\");"), vec!["string"]);
    assert_eq!(run("print(typeof null);"), vec!["null"]);
    assert_eq!(run("print(typeof true);"), vec!["boolean"]);
    assert_eq!(run("print(typeof []);"), vec!["list"]);
    assert_eq!(run("print(typeof print);"), vec!["function"]);
    assert_eq!(run("class A { } print(typeof A); print(typeof A());"), vec!["class", "instance"]);
}

#[test]
fn switch_expression_with_patterns() {
    let source = r#"
        var n = 5;
        var r = switch (n) {
            1, 2 -> "lo";
            is Number -> "num";
            else -> "?";
        };
        print(r);
    "#;
    assert_eq!(run(source), vec!["num"]);
}

#[test]
fn switch_statement_form() {
    let source = r#"
        var n = 2;
        switch (n) {
            1 -> print("one");
            2 -> print("two");
            else -> { print("other"); }
        }
        print("done");
    "#;
    assert_eq!(run(source), vec!["two", "done"]);
}

#[test]
fn switch_pattern_kinds() {
    let source = r#"
        function describe(v) {
            return switch (v) {
                in [1, 2, 3] -> "small";
                |> |x| typeof x == "number" && x > 100 -> "big";
                !is Number -> "not a number";
                else -> "other";
            };
        }
        print(describe(2));
        print(describe(500));
        print(describe("hi"));
        print(describe(50));
    "#;
    assert_eq!(run(source), vec!["small", "big", "not a number", "other"]);
}

#[test]
fn switch_without_match_yields_null() {
    assert_eq!(run("print(switch (9) { 1 -> \"one\"; });"), vec!["null"]);
}

#[test]
fn list_method_catalog() {
    assert_eq!(run("print([1, 2, 3].map(|x| x * x));"), vec!["[1, 4, 9]"]);
    assert_eq!(run("print([1, 2, 3, 4].filter(|x| x % 2 == 0));"), vec!["[2, 4]"]);
    assert_eq!(run("print([1, 2, 3, 4].reduce(|a, b| a + b));"), vec!["10"]);
    assert_eq!(run("print([1, 2, 3].reduce(|a, b| a + b, 10));"), vec!["16"]);
    assert_eq!(run("print([1, 2].any(|x| x > 1));"), vec!["true"]);
    assert_eq!(run("print([1, 2].every(|x| x > 1));"), vec!["false"]);
    assert_eq!(run("var l = [1, 2]; l.push(3); print(l);"), vec!["[1, 2, 3]"]);
    assert_eq!(run("var l = [1, 2]; print(l.pop()); print(l);"), vec!["2", "[1]"]);
    assert_eq!(run("var l = [1, 2]; l.extend([3, 4]); print(l);"), vec!["[1, 2, 3, 4]"]);
    assert_eq!(run("var l = [1, 2]; l.clear(); print(l.length());"), vec!["0"]);
    assert_eq!(run("var l = [1, 2, 3]; l.reverse(); print(l);"), vec!["[3, 2, 1]"]);
    assert_eq!(run("print([5, 1, 5].indexOf(5));"), vec!["0"]);
    assert_eq!(run("print([5, 1, 5].lastIndexOf(5));"), vec!["2"]);
    assert_eq!(run("print([5, 1, 5].indexOf(9));"), vec!["-1"]);
    assert_eq!(run("var l = [1, 2]; l.fill(0); print(l);"), vec!["[0, 0]"]);
    assert_eq!(run("print([].ofLength(3));"), vec!["[null, null, null]"]);
    assert_eq!(
        run("var out = []; [1, 2].forEach(|x| out.push(x * 10)); print(out);"),
        vec!["[10, 20]"]
    );
}

#[test]
fn list_sort_is_stable_and_takes_a_comparator() {
    assert_eq!(run("var l = [3, 1, 2]; l.sort(); print(l);"), vec!["[1, 2, 3]"]);
    assert_eq!(
        run("var l = [3, 1, 2]; l.sort(|a, b| b - a); print(l);"),
        vec!["[3, 2, 1]"]
    );
    // Stability: pairs with equal keys keep their order.
    let source = r#"
        var l = [[1, "a"], [0, "b"], [1, "c"], [0, "d"]];
        l.sort(|a, b| a[0] - b[0]);
        print(l.map(|p| p[1]));
    "#;
    assert_eq!(run(source), vec!["[\"b\", \"d\", \"a\", \"c\"]"]);
}

#[test]
fn string_method_catalog() {
    assert_eq!(run("print(\"hello\".length());"), vec!["5"]);
    assert_eq!(run("print(\"ab\".concat(\"cd\"));"), vec!["abcd"]);
    assert_eq!(run("print(\"hello\".startsWith(\"he\"));"), vec!["true"]);
    assert_eq!(run("print(\"hello\".endsWith(\"lo\"));"), vec!["true"]);
    assert_eq!(run("print(\"hello\".indexOf(\"l\"));"), vec!["2"]);
    assert_eq!(run("print(\"hello\".lastIndexOf(\"l\"));"), vec!["3"]);
    assert_eq!(run("print(\"hello\".indexOf(\"z\"));"), vec!["-1"]);
    assert_eq!(run("print(\"hello\".substring(1, 3));"), vec!["el"]);
    assert_eq!(run("print(\"hello\".substring(0, -1));"), vec!["hell"]);
    assert_eq!(run("print(\"ab\".repeat(3));"), vec!["ababab"]);
    assert_eq!(run("print(\"3.5\".parseNumber());"), vec!["3.5"]);
    assert_eq!(run("print(\"nope\".parseNumber());"), vec!["null"]);
    assert_eq!(run("print(\"abc\"[1]);"), vec!["b"]);
    assert_eq!(run("print(\"abc\"[-1]);"), vec!["c"]);
}

#[test]
fn global_natives() {
    assert_eq!(run("print(sqrt(16));"), vec!["4"]);
    assert_eq!(run("print(toString(42) + \"!\");"), vec!["42!"]);
    assert_eq!(run("print(repr(\"x\"));"), vec!["\"x\""]);
    assert_eq!(run("print(repr(5));"), vec!["5"]);
    assert_eq!(run("print(NaN == NaN);"), vec!["false"]);
    assert_eq!(run("print(Infinity);"), vec!["Infinity"]);
    assert_eq!(run("print(clock() >= 0);"), vec!["true"]);
    assert_eq!(run("print(THIS_MODULE);"), vec!["$main$"]);
}

#[test]
fn concatenation_invokes_to_string_left_to_right() {
    let source = r#"
        class L { toString() { print("L"); return "l"; } }
        class R { toString() { print("R"); return "r"; } }
        print(L() + "" + R());
    "#;
    assert_eq!(run(source), vec!["L", "R", "lr"]);
}

#[test]
fn globals_persist_across_runs() {
    let mut interp = Interpreter::new(".");
    interp.run("var total = 1;").unwrap();
    interp.run("total += 2;").unwrap();
    interp.run("print(total);").unwrap();
    assert_eq!(interp.take_output(), vec!["3"]);
}

#[test]
fn host_natives_join_the_call_protocol() {
    fn triple(_vm: &mut dgn::Vm, _receiver: Option<dgn::Value>, args: Vec<dgn::Value>) -> dgn::NativeResult {
        let n = match args[0] {
            dgn::Value::Number(n) => n,
            _ => 0.0,
        };
        Ok(dgn::Value::Number(n * 3.0))
    }

    let mut interp = Interpreter::new(".");
    interp.define_native("triple", 1, false, triple);
    interp.run("print(triple(7)); print([1, 2].map(triple));").unwrap();
    assert_eq!(interp.take_output(), vec!["21", "[3, 6]"]);
}

#[test]
fn upvalues_resolve_through_multiple_levels() {
    let source = r#"
        function a() {
            var x = "x";
            function b() {
                function c() { return x; }
                return c;
            }
            return b()();
        }
        print(a());
    "#;
    assert_eq!(run(source), vec!["x"]);
}

#[test]
fn sibling_closures_share_one_cell() {
    let source = r#"
        function make() {
            var n = 0;
            var inc = || { n += 1; return n; };
            var get = || n;
            return [inc, get];
        }
        var fs = make();
        fs[0]();
        fs[0]();
        print(fs[1]());
    "#;
    assert_eq!(run(source), vec!["2"]);
}

#[test]
fn local_functions_can_recurse_through_their_own_capture() {
    let source = r#"
        function outer() {
            function fact(n) {
                if (n <= 1) return 1;
                return n * fact(n - 1);
            }
            return fact(5);
        }
        print(outer());
    "#;
    assert_eq!(run(source), vec!["120"]);
}

#[test]
fn constructors_return_their_instance() {
    let source = r#"
        class Counter {
            constructor() { this.n = 0; }
            bump() { this.n += 1; return this; }
        }
        print(Counter().bump().bump().n);
    "#;
    assert_eq!(run(source), vec!["2"]);
}

#[test]
fn super_reaches_the_parent_constructor() {
    let source = r#"
        class A { constructor(x) { this.x = x; } }
        class B : A { constructor(x) { super.constructor(x + 1); } }
        print(B(1).x);
    "#;
    assert_eq!(run(source), vec!["2"]);
}

#[test]
fn block_locals_shadow_globals() {
    let source = r#"
        var x = "global";
        {
            var x = "inner";
            print(x);
        }
        print(x);
    "#;
    assert_eq!(run(source), vec!["inner", "global"]);
}

#[test]
fn explicit_iterator_instances() {
    let source = r#"
        var it = Iterator("hi");
        print(it.more());
        print(it.next());
        print(it.next());
        print(it.more());
    "#;
    assert_eq!(run(source), vec!["true", "h", "i", "false"]);
}

#[test]
fn more_compound_operators() {
    assert_eq!(run("var n = 17; n %= 5; print(n);"), vec!["2"]);
    assert_eq!(run("var d = 9; d /= 2; print(d);"), vec!["4.5"]);
    assert_eq!(run("var b = 6; b &= 3; print(b);"), vec!["2"]);
    assert_eq!(run("var b = 6; b ^= 3; print(b);"), vec!["5"]);
    assert_eq!(run("var b = 1; b |= 4; print(b);"), vec!["5"]);
}

#[test]
fn nested_ternaries_are_right_associative() {
    assert_eq!(run("print(false ? \"a\" : true ? \"b\" : \"c\");"), vec!["b"]);
}

#[test]
fn nested_list_indexing() {
    assert_eq!(run("print([[1, 2], [3]][0][1]);"), vec!["2"]);
    assert_eq!(run("print([[1, 2], [3]][-1][0]);"), vec!["3"]);
}

#[test]
fn switch_patterns_accept_ranges() {
    assert_eq!(
        run("switch (3) { in 1..5 -> print(\"in range\"); else -> print(\"out\"); }"),
        vec!["in range"]
    );
    assert_eq!(
        run("switch (9) { in 1..5 -> print(\"in range\"); else -> print(\"out\"); }"),
        vec!["out"]
    );
}

// ---------------------------------------------------------------------------
// Modules
// ---------------------------------------------------------------------------

fn interp_with_files(files: &[(&str, &str)]) -> Interpreter {
    let mut loader = MemoryLoader::new();
    for (path, source) in files {
        loader.add(*path, *source);
    }
    Interpreter::with_loader("", Box::new(loader))
}

#[test]
fn import_exposes_exports() {
    let mut interp = interp_with_files(&[(
        "lib.dgn",
        "function add(a, b) { return a + b; } var version = 2; export add; export version;",
    )]);
    interp
        .run("var m = import \"lib\"; print(m.add(2, 3)); print(m.version);")
        .unwrap();
    assert_eq!(interp.take_output(), vec!["5", "2"]);
}

#[test]
fn imports_run_once_and_are_cached() {
    let mut interp = interp_with_files(&[("mod.dgn", "print(\"loaded\"); var v = 1; export v;")]);
    interp
        .run("var a = import \"mod\"; var b = import \"mod\"; print(a is b);")
        .unwrap();
    assert_eq!(interp.take_output(), vec!["loaded", "true"]);
}

#[test]
fn modules_have_their_own_globals() {
    let mut interp = interp_with_files(&[(
        "lib.dgn",
        "var name = \"lib\"; function whoami() { return THIS_MODULE; } export whoami;",
    )]);
    interp
        .run("var name = \"main\"; var m = import \"lib\"; print(m.whoami()); print(name);")
        .unwrap();
    assert_eq!(interp.take_output(), vec!["lib", "main"]);
}

#[test]
fn exported_exception_classes_work_across_modules() {
    let mut interp = interp_with_files(&[(
        "errs.dgn",
        "class MyErr : Exception { } export MyErr; function boom() { throw MyErr(\"from lib\"); } export boom;",
    )]);
    interp
        .run(
            r#"
            var m = import "errs";
            try { m.boom(); } catch (e) {
                print(e instanceof m.MyErr);
                print(e instanceof Exception);
                print(e.message);
            }
            "#,
        )
        .unwrap();
    assert_eq!(interp.take_output(), vec!["true", "true", "from lib"]);
}

#[test]
fn import_objects_expose_object_methods() {
    let mut interp = interp_with_files(&[("pair.dgn", "var a = 1; var b = 2; export a; export b;")]);
    interp
        .run("var m = import \"pair\"; print(m.keys().length()); print(m.hasProperty(\"a\"));")
        .unwrap();
    assert_eq!(interp.take_output(), vec!["2", "true"]);
}

#[test]
fn unexported_globals_stay_private() {
    let mut interp = interp_with_files(&[("lib.dgn", "var hidden = 1; var shown = 2; export shown;")]);
    interp
        .run(
            r#"
            var m = import "lib";
            print(m.shown);
            try { m.hidden; } catch (e) { print(e instanceof PropertyException); }
            "#,
        )
        .unwrap();
    assert_eq!(interp.take_output(), vec!["2", "true"]);
}
