//! Global native functions and the baseline global table.
//!
//! Every module starts from the same set of globals: the built-in classes,
//! the exception hierarchy, `NaN`/`Infinity`, and the native functions
//! below. `print` output is captured in the VM's output buffer so the
//! embedder decides where it goes.

use std::io::BufRead;

use crate::heap::Heap;
use crate::methods::{add_native, Builtins};
use crate::table::Table;
use crate::value::{ObjRef, Value};
use crate::vm::{Exc, NativeResult, Vm};

/// Seed the baseline global table every module is born with.
pub(crate) fn register_globals(
    heap: &mut Heap,
    builtins: &Builtins,
    globals: &mut Table,
    pinned: &mut Vec<ObjRef>,
) {
    let mut define = |heap: &mut Heap, name: &str, value: Value| {
        let name_ref = heap.intern(name);
        pinned.push(name_ref);
        let hash = heap.str_hash(name_ref);
        globals.set(name_ref, hash, value);
    };

    define(heap, "Object", Value::Obj(builtins.object_class));
    define(heap, "Iterator", Value::Obj(builtins.iterator_class));
    define(heap, "Import", Value::Obj(builtins.import_class));
    define(heap, "Exception", Value::Obj(builtins.exception_class));
    define(heap, "TypeException", Value::Obj(builtins.type_exception));
    define(heap, "ArityException", Value::Obj(builtins.arity_exception));
    define(heap, "PropertyException", Value::Obj(builtins.property_exception));
    define(heap, "IndexException", Value::Obj(builtins.index_exception));
    define(
        heap,
        "UndefinedVariableException",
        Value::Obj(builtins.undefined_variable_exception),
    );
    define(
        heap,
        "StackOverflowException",
        Value::Obj(builtins.stack_overflow_exception),
    );
    define(heap, "NaN", Value::Number(f64::NAN));
    define(heap, "Infinity", Value::Number(f64::INFINITY));

    add_native(heap, globals, "print", 1, true, native_print);
    add_native(heap, globals, "input", 0, false, native_input);
    add_native(heap, globals, "clock", 0, false, native_clock);
    add_native(heap, globals, "toString", 1, false, native_to_string);
    add_native(heap, globals, "repr", 1, false, native_repr);
    add_native(heap, globals, "sqrt", 1, false, native_sqrt);
}

/// `print(v, ...)`: stringify every argument, join with spaces, emit one
/// output line.
fn native_print(vm: &mut Vm, _receiver: Option<Value>, args: Vec<Value>) -> NativeResult {
    let mut parts = Vec::with_capacity(args.len());
    for arg in args {
        parts.push(vm.stringify(arg)?);
    }
    vm.print_line(parts.join(" "));
    Ok(Value::Null)
}

/// `input()`: one line from stdin without its trailing newline, or `null`
/// at end of input.
fn native_input(vm: &mut Vm, _receiver: Option<Value>, _args: Vec<Value>) -> NativeResult {
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(0) | Err(_) => Ok(Value::Null),
        Ok(_) => {
            while line.ends_with('\n') || line.ends_with('\r') {
                line.pop();
            }
            Ok(vm.alloc_string(&line))
        }
    }
}

/// `clock()`: seconds elapsed since the interpreter started.
fn native_clock(vm: &mut Vm, _receiver: Option<Value>, _args: Vec<Value>) -> NativeResult {
    Ok(Value::Number(vm.clock_seconds()))
}

fn native_to_string(vm: &mut Vm, _receiver: Option<Value>, args: Vec<Value>) -> NativeResult {
    let text = vm.stringify(args[0])?;
    Ok(vm.alloc_string(&text))
}

fn native_repr(vm: &mut Vm, _receiver: Option<Value>, args: Vec<Value>) -> NativeResult {
    let text = vm.repr(args[0])?;
    Ok(vm.alloc_string(&text))
}

fn native_sqrt(vm: &mut Vm, _receiver: Option<Value>, args: Vec<Value>) -> NativeResult {
    match args[0].as_number() {
        Some(n) => Ok(Value::Number(n.sqrt())),
        None => Err(vm.native_exception(Exc::Type, "sqrt expects a number.")),
    }
}
