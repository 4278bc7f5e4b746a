//! Built-in classes and per-type method catalogs.
//!
//! [`bootstrap`] runs once while the VM starts (with collection disabled)
//! and builds everything scripts see by default: the base object class and
//! its methods, the `Iterator` and `Import` classes, the `Exception`
//! hierarchy, and the method tables consulted when a list or string
//! receives a method call. Every entry is a native following the VM's
//! call protocol, so language closures and built-ins dispatch identically.

use std::cmp::Ordering;

use crate::heap::Heap;
use crate::object::{Obj, ObjClass, ObjInstance, ObjNative};
use crate::table::Table;
use crate::value::{ObjRef, Value};
use crate::vm::{Exc, NativeError, NativeFn, NativeResult, Vm};

/// Handles to everything the VM needs to reach built-ins directly.
pub(crate) struct Builtins {
    pub object_class: ObjRef,
    pub iterator_class: ObjRef,
    pub import_class: ObjRef,
    pub exception_class: ObjRef,
    pub type_exception: ObjRef,
    pub arity_exception: ObjRef,
    pub property_exception: ObjRef,
    pub index_exception: ObjRef,
    pub undefined_variable_exception: ObjRef,
    pub stack_overflow_exception: ObjRef,
    pub list_methods: Table,
    pub string_methods: Table,
}

impl Builtins {
    pub(crate) fn exception_for(&self, kind: Exc) -> ObjRef {
        match kind {
            Exc::Type => self.type_exception,
            Exc::Arity => self.arity_exception,
            Exc::Property => self.property_exception,
            Exc::Index => self.index_exception,
            Exc::UndefinedVariable => self.undefined_variable_exception,
            Exc::StackOverflow => self.stack_overflow_exception,
        }
    }

    /// Every class handle that must stay rooted across collections.
    pub(crate) fn class_roots(&self) -> [ObjRef; 10] {
        [
            self.object_class,
            self.iterator_class,
            self.import_class,
            self.exception_class,
            self.type_exception,
            self.arity_exception,
            self.property_exception,
            self.index_exception,
            self.undefined_variable_exception,
            self.stack_overflow_exception,
        ]
    }
}

/// Interned names the VM looks up at runtime.
pub(crate) struct Names {
    pub constructor: ObjRef,
    pub to_string: ObjRef,
    pub message: ObjRef,
    pub stack_trace: ObjRef,
    pub this_module: ObjRef,
    pub data: ObjRef,
    pub index: ObjRef,
}

/// Build the built-in classes and method tables. Runs with collection
/// disabled; the returned pin list keeps the interned names alive.
pub(crate) fn bootstrap(heap: &mut Heap) -> (Builtins, Names, Vec<ObjRef>) {
    let mut pinned = Vec::new();
    let mut pin = |heap: &mut Heap, text: &str| {
        let handle = heap.intern(text);
        pinned.push(handle);
        handle
    };

    let names = Names {
        constructor: pin(heap, "constructor"),
        to_string: pin(heap, "toString"),
        message: pin(heap, "message"),
        stack_trace: pin(heap, "stackTrace"),
        this_module: pin(heap, "THIS_MODULE"),
        data: pin(heap, "data"),
        index: pin(heap, "index"),
    };

    // The base object class; every instance inherits these.
    let mut object_methods = Table::new();
    add_native(heap, &mut object_methods, "keys", 0, false, object_keys);
    add_native(heap, &mut object_methods, "values", 0, false, object_values);
    add_native(heap, &mut object_methods, "entries", 0, false, object_entries);
    add_native(heap, &mut object_methods, "hasProperty", 1, false, object_has_property);
    add_native(heap, &mut object_methods, "toString", 0, false, object_to_string);

    let object_name = heap.intern("Object");
    let object_class = heap.alloc(Obj::Class(ObjClass {
        name: object_name,
        methods: object_methods.clone(),
        superclass: None,
    }));

    let mut iterator_methods = object_methods.clone();
    add_native(heap, &mut iterator_methods, "constructor", 1, false, iterator_constructor);
    add_native(heap, &mut iterator_methods, "iterator", 0, false, iterator_identity);
    add_native(heap, &mut iterator_methods, "more", 0, false, iterator_more);
    add_native(heap, &mut iterator_methods, "next", 0, false, iterator_next);
    let iterator_name = heap.intern("Iterator");
    let iterator_class = heap.alloc(Obj::Class(ObjClass {
        name: iterator_name,
        methods: iterator_methods,
        superclass: Some(object_class),
    }));

    let import_name = heap.intern("Import");
    let import_class = heap.alloc(Obj::Class(ObjClass {
        name: import_name,
        methods: object_methods.clone(),
        superclass: Some(object_class),
    }));

    let mut exception_methods = object_methods.clone();
    add_native(heap, &mut exception_methods, "constructor", 1, false, exception_constructor);
    let exception_name = heap.intern("Exception");
    let exception_class = heap.alloc(Obj::Class(ObjClass {
        name: exception_name,
        methods: exception_methods.clone(),
        superclass: Some(object_class),
    }));

    let mut subclass = |heap: &mut Heap, name: &str| {
        let class_name = heap.intern(name);
        heap.alloc(Obj::Class(ObjClass {
            name: class_name,
            methods: exception_methods.clone(),
            superclass: Some(exception_class),
        }))
    };
    let type_exception = subclass(heap, "TypeException");
    let arity_exception = subclass(heap, "ArityException");
    let property_exception = subclass(heap, "PropertyException");
    let index_exception = subclass(heap, "IndexException");
    let undefined_variable_exception = subclass(heap, "UndefinedVariableException");
    let stack_overflow_exception = subclass(heap, "StackOverflowException");

    let mut list_methods = Table::new();
    add_native(heap, &mut list_methods, "length", 0, false, list_length);
    add_native(heap, &mut list_methods, "push", 1, false, list_push);
    add_native(heap, &mut list_methods, "pop", 0, false, list_pop);
    add_native(heap, &mut list_methods, "concat", 1, false, list_concat);
    add_native(heap, &mut list_methods, "extend", 1, false, list_extend);
    add_native(heap, &mut list_methods, "clear", 0, false, list_clear);
    add_native(heap, &mut list_methods, "filter", 1, false, list_filter);
    add_native(heap, &mut list_methods, "fill", 1, false, list_fill);
    add_native(heap, &mut list_methods, "forEach", 1, false, list_for_each);
    add_native(heap, &mut list_methods, "indexOf", 1, false, list_index_of);
    add_native(heap, &mut list_methods, "lastIndexOf", 1, false, list_last_index_of);
    add_native(heap, &mut list_methods, "iterator", 0, false, list_iterator);
    add_native(heap, &mut list_methods, "map", 1, false, list_map);
    add_native(heap, &mut list_methods, "ofLength", 1, false, list_of_length);
    add_native(heap, &mut list_methods, "reduce", 1, true, list_reduce);
    add_native(heap, &mut list_methods, "reverse", 0, false, list_reverse);
    add_native(heap, &mut list_methods, "sort", 0, true, list_sort);
    add_native(heap, &mut list_methods, "any", 1, false, list_any);
    add_native(heap, &mut list_methods, "every", 1, false, list_every);

    let mut string_methods = Table::new();
    add_native(heap, &mut string_methods, "length", 0, false, string_length);
    add_native(heap, &mut string_methods, "concat", 1, false, string_concat);
    add_native(heap, &mut string_methods, "endsWith", 1, false, string_ends_with);
    add_native(heap, &mut string_methods, "indexOf", 1, false, string_index_of);
    add_native(heap, &mut string_methods, "lastIndexOf", 1, false, string_last_index_of);
    add_native(heap, &mut string_methods, "iterator", 0, false, string_iterator);
    add_native(heap, &mut string_methods, "parseNumber", 0, false, string_parse_number);
    add_native(heap, &mut string_methods, "repeat", 1, false, string_repeat);
    add_native(heap, &mut string_methods, "startsWith", 1, false, string_starts_with);
    add_native(heap, &mut string_methods, "substring", 2, false, string_substring);

    let builtins = Builtins {
        object_class,
        iterator_class,
        import_class,
        exception_class,
        type_exception,
        arity_exception,
        property_exception,
        index_exception,
        undefined_variable_exception,
        stack_overflow_exception,
        list_methods,
        string_methods,
    };
    (builtins, names, pinned)
}

/// Allocate a native and put it in `table` under `name`.
pub(crate) fn add_native(
    heap: &mut Heap,
    table: &mut Table,
    name: &str,
    arity: u8,
    varargs: bool,
    func: NativeFn,
) {
    let name_ref = heap.intern(name);
    let native = heap.alloc(Obj::Native(ObjNative {
        name: name_ref,
        func,
        arity,
        varargs,
        receiver: None,
    }));
    let hash = heap.str_hash(name_ref);
    table.set(name_ref, hash, Value::Obj(native));
}

// ---------------------------------------------------------------------------
// Argument helpers
// ---------------------------------------------------------------------------

/// Method natives are always dispatched with a bound receiver.
fn receiver_handle(receiver: Option<Value>) -> ObjRef {
    match receiver {
        Some(Value::Obj(handle)) => handle,
        _ => unreachable!("method native dispatched without a receiver"),
    }
}

fn want_whole(vm: &mut Vm, value: Value, what: &str) -> Result<i64, NativeError> {
    value
        .as_whole_number()
        .ok_or_else(|| vm.native_exception(Exc::Type, format!("{what} must be a whole number.")))
}

fn want_string(vm: &mut Vm, value: Value, what: &str) -> Result<String, NativeError> {
    if let Value::Obj(r) = value
        && let Obj::Str(s) = vm.heap.get(r)
    {
        return Ok(s.chars.to_string());
    }
    Err(vm.native_exception(Exc::Type, format!("{what} must be a string.")))
}

fn list_items(vm: &Vm, handle: ObjRef) -> Vec<Value> {
    match vm.heap.get(handle) {
        Obj::List(list) => list.items.clone(),
        _ => unreachable!("receiver is not a list"),
    }
}

fn string_text(vm: &Vm, handle: ObjRef) -> String {
    vm.heap.str_value(handle).to_string()
}

fn instance_field(vm: &Vm, instance: ObjRef, key: ObjRef) -> Value {
    let hash = vm.heap.str_hash(key);
    match vm.heap.get(instance) {
        Obj::Instance(i) => i.fields.get(key, hash).unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn set_instance_field(vm: &mut Vm, instance: ObjRef, key: ObjRef, value: Value) {
    let hash = vm.heap.str_hash(key);
    if let Obj::Instance(i) = vm.heap.get_mut(instance) {
        i.fields.set(key, hash, value);
    }
}

/// Build an `Iterator` instance over a list or string value.
fn make_iterator(vm: &mut Vm, data: Value) -> Value {
    let class = vm.builtins.iterator_class;
    let instance = vm.alloc(Obj::Instance(ObjInstance {
        class,
        fields: Table::new(),
    }));
    let (data_key, index_key) = (vm.names.data, vm.names.index);
    set_instance_field(vm, instance, data_key, data);
    set_instance_field(vm, instance, index_key, Value::Number(0.0));
    Value::Obj(instance)
}

// ---------------------------------------------------------------------------
// Object methods (inherited by every instance)
// ---------------------------------------------------------------------------

fn object_keys(vm: &mut Vm, receiver: Option<Value>, _args: Vec<Value>) -> NativeResult {
    let instance = receiver_handle(receiver);
    let keys: Vec<Value> = match vm.heap.get(instance) {
        Obj::Instance(i) => i.fields.iter().map(|(k, _)| Value::Obj(k)).collect(),
        _ => Vec::new(),
    };
    Ok(vm.alloc_list(keys))
}

fn object_values(vm: &mut Vm, receiver: Option<Value>, _args: Vec<Value>) -> NativeResult {
    let instance = receiver_handle(receiver);
    let values: Vec<Value> = match vm.heap.get(instance) {
        Obj::Instance(i) => i.fields.iter().map(|(_, v)| v).collect(),
        _ => Vec::new(),
    };
    Ok(vm.alloc_list(values))
}

fn object_entries(vm: &mut Vm, receiver: Option<Value>, _args: Vec<Value>) -> NativeResult {
    let instance = receiver_handle(receiver);
    let pairs: Vec<(ObjRef, Value)> = match vm.heap.get(instance) {
        Obj::Instance(i) => i.fields.iter().collect(),
        _ => Vec::new(),
    };
    let mark = vm.temp_roots.len();
    for (key, value) in pairs {
        let entry = vm.alloc_list(vec![Value::Obj(key), value]);
        vm.temp_roots.push(entry);
    }
    let entries = vm.temp_roots.split_off(mark);
    Ok(vm.alloc_list(entries))
}

fn object_has_property(vm: &mut Vm, receiver: Option<Value>, args: Vec<Value>) -> NativeResult {
    let instance = receiver_handle(receiver);
    let Value::Obj(key) = args[0] else {
        return Err(vm.native_exception(Exc::Type, "Property name must be a string."));
    };
    if !matches!(vm.heap.get(key), Obj::Str(_)) {
        return Err(vm.native_exception(Exc::Type, "Property name must be a string."));
    }
    let hash = vm.heap.str_hash(key);
    let result = match vm.heap.get(instance) {
        Obj::Instance(i) => i.fields.contains(key, hash),
        _ => false,
    };
    Ok(Value::Bool(result))
}

fn object_to_string(vm: &mut Vm, receiver: Option<Value>, _args: Vec<Value>) -> NativeResult {
    let instance = receiver_handle(receiver);
    let class_name = match vm.heap.get(instance) {
        Obj::Instance(i) => match vm.heap.get(i.class) {
            Obj::Class(c) => vm.heap.str_value(c.name).to_string(),
            _ => "Object".to_string(),
        },
        _ => "Object".to_string(),
    };
    Ok(vm.alloc_string(&format!("<{class_name} instance>")))
}

// ---------------------------------------------------------------------------
// Exception constructor
// ---------------------------------------------------------------------------

fn exception_constructor(vm: &mut Vm, receiver: Option<Value>, args: Vec<Value>) -> NativeResult {
    let instance = receiver_handle(receiver);
    let key = vm.names.message;
    set_instance_field(vm, instance, key, args[0]);
    Ok(Value::Null)
}

// ---------------------------------------------------------------------------
// Iterator methods
// ---------------------------------------------------------------------------

fn iterator_constructor(vm: &mut Vm, receiver: Option<Value>, args: Vec<Value>) -> NativeResult {
    let instance = receiver_handle(receiver);
    let data = args[0];
    let valid = matches!(data, Value::Obj(r) if matches!(vm.heap.get(r), Obj::List(_) | Obj::Str(_)));
    if !valid {
        return Err(vm.native_exception(Exc::Type, "Iterator data must be a list or string."));
    }
    let (data_key, index_key) = (vm.names.data, vm.names.index);
    set_instance_field(vm, instance, data_key, data);
    set_instance_field(vm, instance, index_key, Value::Number(0.0));
    Ok(Value::Null)
}

fn iterator_identity(_vm: &mut Vm, receiver: Option<Value>, _args: Vec<Value>) -> NativeResult {
    Ok(receiver.unwrap_or(Value::Null))
}

fn iterator_more(vm: &mut Vm, receiver: Option<Value>, _args: Vec<Value>) -> NativeResult {
    let instance = receiver_handle(receiver);
    let data = instance_field(vm, instance, vm.names.data);
    let index = instance_field(vm, instance, vm.names.index)
        .as_number()
        .unwrap_or(0.0) as usize;
    let remaining = match data {
        Value::Obj(r) => match vm.heap.get(r) {
            Obj::List(list) => index < list.items.len(),
            Obj::Str(s) => index < s.chars.chars().count(),
            _ => false,
        },
        _ => false,
    };
    Ok(Value::Bool(remaining))
}

fn iterator_next(vm: &mut Vm, receiver: Option<Value>, _args: Vec<Value>) -> NativeResult {
    let instance = receiver_handle(receiver);
    let data = instance_field(vm, instance, vm.names.data);
    let index = instance_field(vm, instance, vm.names.index)
        .as_number()
        .unwrap_or(0.0) as usize;

    // Character results need an allocation, which must happen outside the
    // heap borrow.
    enum Next {
        Item(Value),
        Char(String),
        Exhausted,
    }
    let next = match data {
        Value::Obj(r) => match vm.heap.get(r) {
            Obj::List(list) => list
                .items
                .get(index)
                .map(|&item| Next::Item(item))
                .unwrap_or(Next::Exhausted),
            Obj::Str(s) => s
                .chars
                .chars()
                .nth(index)
                .map(|c| Next::Char(c.to_string()))
                .unwrap_or(Next::Exhausted),
            _ => Next::Exhausted,
        },
        _ => Next::Exhausted,
    };
    let value = match next {
        Next::Item(item) => item,
        Next::Char(text) => vm.alloc_string(&text),
        Next::Exhausted => return Err(vm.native_exception(Exc::Index, "Iterator is exhausted.")),
    };
    let index_key = vm.names.index;
    set_instance_field(vm, instance, index_key, Value::Number((index + 1) as f64));
    Ok(value)
}

// ---------------------------------------------------------------------------
// List methods
// ---------------------------------------------------------------------------

fn list_length(vm: &mut Vm, receiver: Option<Value>, _args: Vec<Value>) -> NativeResult {
    let list = receiver_handle(receiver);
    Ok(Value::Number(list_items(vm, list).len() as f64))
}

fn list_push(vm: &mut Vm, receiver: Option<Value>, args: Vec<Value>) -> NativeResult {
    let list = receiver_handle(receiver);
    if let Obj::List(l) = vm.heap.get_mut(list) {
        l.items.push(args[0]);
    }
    Ok(Value::Null)
}

fn list_pop(vm: &mut Vm, receiver: Option<Value>, _args: Vec<Value>) -> NativeResult {
    let list = receiver_handle(receiver);
    let popped = match vm.heap.get_mut(list) {
        Obj::List(l) => l.items.pop(),
        _ => None,
    };
    popped.ok_or_else(|| vm.native_exception(Exc::Index, "Can't pop from an empty list."))
}

fn list_concat(vm: &mut Vm, receiver: Option<Value>, args: Vec<Value>) -> NativeResult {
    let list = receiver_handle(receiver);
    let Value::Obj(other) = args[0] else {
        return Err(vm.native_exception(Exc::Type, "concat expects a list."));
    };
    if !matches!(vm.heap.get(other), Obj::List(_)) {
        return Err(vm.native_exception(Exc::Type, "concat expects a list."));
    }
    let mut items = list_items(vm, list);
    items.extend(list_items(vm, other));
    Ok(vm.alloc_list(items))
}

fn list_extend(vm: &mut Vm, receiver: Option<Value>, args: Vec<Value>) -> NativeResult {
    let list = receiver_handle(receiver);
    let Value::Obj(other) = args[0] else {
        return Err(vm.native_exception(Exc::Type, "extend expects a list."));
    };
    if !matches!(vm.heap.get(other), Obj::List(_)) {
        return Err(vm.native_exception(Exc::Type, "extend expects a list."));
    }
    let extra = list_items(vm, other);
    if let Obj::List(l) = vm.heap.get_mut(list) {
        l.items.extend(extra);
    }
    Ok(Value::Null)
}

fn list_clear(vm: &mut Vm, receiver: Option<Value>, _args: Vec<Value>) -> NativeResult {
    let list = receiver_handle(receiver);
    if let Obj::List(l) = vm.heap.get_mut(list) {
        l.items.clear();
    }
    Ok(Value::Null)
}

fn list_filter(vm: &mut Vm, receiver: Option<Value>, args: Vec<Value>) -> NativeResult {
    let list = receiver_handle(receiver);
    let mut kept = Vec::new();
    for item in list_items(vm, list) {
        let keep = vm.call_nested(args[0], &[item])?;
        if !keep.is_falsey() {
            kept.push(item);
        }
    }
    Ok(vm.alloc_list(kept))
}

fn list_fill(vm: &mut Vm, receiver: Option<Value>, args: Vec<Value>) -> NativeResult {
    let list = receiver_handle(receiver);
    if let Obj::List(l) = vm.heap.get_mut(list) {
        for slot in l.items.iter_mut() {
            *slot = args[0];
        }
    }
    Ok(Value::Null)
}

fn list_for_each(vm: &mut Vm, receiver: Option<Value>, args: Vec<Value>) -> NativeResult {
    let list = receiver_handle(receiver);
    for item in list_items(vm, list) {
        vm.call_nested(args[0], &[item])?;
    }
    Ok(Value::Null)
}

fn list_index_of(vm: &mut Vm, receiver: Option<Value>, args: Vec<Value>) -> NativeResult {
    let list = receiver_handle(receiver);
    let items = list_items(vm, list);
    for (i, &item) in items.iter().enumerate() {
        if vm.heap.values_equal(item, args[0]) {
            return Ok(Value::Number(i as f64));
        }
    }
    Ok(Value::Number(-1.0))
}

fn list_last_index_of(vm: &mut Vm, receiver: Option<Value>, args: Vec<Value>) -> NativeResult {
    let list = receiver_handle(receiver);
    let items = list_items(vm, list);
    for (i, &item) in items.iter().enumerate().rev() {
        if vm.heap.values_equal(item, args[0]) {
            return Ok(Value::Number(i as f64));
        }
    }
    Ok(Value::Number(-1.0))
}

fn list_iterator(vm: &mut Vm, receiver: Option<Value>, _args: Vec<Value>) -> NativeResult {
    let data = receiver.unwrap_or(Value::Null);
    Ok(make_iterator(vm, data))
}

fn list_map(vm: &mut Vm, receiver: Option<Value>, args: Vec<Value>) -> NativeResult {
    let list = receiver_handle(receiver);
    let mark = vm.temp_roots.len();
    for item in list_items(vm, list) {
        let mapped = match vm.call_nested(args[0], &[item]) {
            Ok(value) => value,
            Err(err) => {
                vm.temp_roots.truncate(mark);
                return Err(err);
            }
        };
        vm.temp_roots.push(mapped);
    }
    let results = vm.temp_roots.split_off(mark);
    Ok(vm.alloc_list(results))
}

fn list_of_length(vm: &mut Vm, receiver: Option<Value>, args: Vec<Value>) -> NativeResult {
    let _ = receiver_handle(receiver);
    let n = want_whole(vm, args[0], "Length")?;
    if n < 0 {
        return Err(vm.native_exception(Exc::Type, "Length must not be negative."));
    }
    Ok(vm.alloc_list(vec![Value::Null; n as usize]))
}

fn list_reduce(vm: &mut Vm, receiver: Option<Value>, args: Vec<Value>) -> NativeResult {
    let list = receiver_handle(receiver);
    let items = list_items(vm, list);
    let mut iter = items.into_iter();
    let seed = match args.get(1) {
        Some(&init) => init,
        None => match iter.next() {
            Some(first) => first,
            None => {
                return Err(vm.native_exception(
                    Exc::Index,
                    "Can't reduce an empty list without an initial value.",
                ));
            }
        },
    };

    let mark = vm.temp_roots.len();
    vm.temp_roots.push(seed);
    for item in iter {
        let acc = *vm.temp_roots.last().expect("seed pushed above");
        let next = match vm.call_nested(args[0], &[acc, item]) {
            Ok(value) => value,
            Err(err) => {
                vm.temp_roots.truncate(mark);
                return Err(err);
            }
        };
        *vm.temp_roots.last_mut().expect("seed pushed above") = next;
    }
    let result = *vm.temp_roots.last().expect("seed pushed above");
    vm.temp_roots.truncate(mark);
    Ok(result)
}

fn list_reverse(vm: &mut Vm, receiver: Option<Value>, _args: Vec<Value>) -> NativeResult {
    let list = receiver_handle(receiver);
    if let Obj::List(l) = vm.heap.get_mut(list) {
        l.items.reverse();
    }
    Ok(Value::Null)
}

/// Compare two values for `sort`: by the user comparator (which must return
/// a number) when given, otherwise numerically.
enum Comparator {
    Default,
    User(Value),
}

impl Comparator {
    fn compare(&self, vm: &mut Vm, a: Value, b: Value) -> Result<Ordering, NativeError> {
        match self {
            Comparator::Default => match (a.as_number(), b.as_number()) {
                (Some(x), Some(y)) => Ok(x.partial_cmp(&y).unwrap_or(Ordering::Equal)),
                _ => Err(vm.native_exception(
                    Exc::Type,
                    "sort without a comparator requires numbers.",
                )),
            },
            Comparator::User(f) => {
                let result = vm.call_nested(*f, &[a, b])?;
                match result.as_number() {
                    Some(n) if n < 0.0 => Ok(Ordering::Less),
                    Some(n) if n > 0.0 => Ok(Ordering::Greater),
                    Some(_) => Ok(Ordering::Equal),
                    None => {
                        Err(vm.native_exception(Exc::Type, "Comparator must return a number."))
                    }
                }
            }
        }
    }
}

/// Stable bottom-up merge sort; the comparator may run user code.
fn list_sort(vm: &mut Vm, receiver: Option<Value>, args: Vec<Value>) -> NativeResult {
    let list = receiver_handle(receiver);
    let comparator = match args.first() {
        Some(&f) => Comparator::User(f),
        None => Comparator::Default,
    };

    let mut items = list_items(vm, list);
    let len = items.len();
    let mut buffer = items.clone();
    let mut width = 1;
    while width < len {
        let mut start = 0;
        while start < len {
            let mid = (start + width).min(len);
            let end = (start + 2 * width).min(len);
            // Merge items[start..mid] and items[mid..end] into buffer.
            let (mut left, mut right, mut out) = (start, mid, start);
            while left < mid && right < end {
                let ordering = comparator.compare(vm, items[left], items[right])?;
                if ordering == Ordering::Greater {
                    buffer[out] = items[right];
                    right += 1;
                } else {
                    buffer[out] = items[left];
                    left += 1;
                }
                out += 1;
            }
            while left < mid {
                buffer[out] = items[left];
                left += 1;
                out += 1;
            }
            while right < end {
                buffer[out] = items[right];
                right += 1;
                out += 1;
            }
            start = end;
        }
        std::mem::swap(&mut items, &mut buffer);
        width *= 2;
    }

    if let Obj::List(l) = vm.heap.get_mut(list) {
        l.items = items;
    }
    Ok(Value::Null)
}

fn list_any(vm: &mut Vm, receiver: Option<Value>, args: Vec<Value>) -> NativeResult {
    let list = receiver_handle(receiver);
    for item in list_items(vm, list) {
        let result = vm.call_nested(args[0], &[item])?;
        if !result.is_falsey() {
            return Ok(Value::Bool(true));
        }
    }
    Ok(Value::Bool(false))
}

fn list_every(vm: &mut Vm, receiver: Option<Value>, args: Vec<Value>) -> NativeResult {
    let list = receiver_handle(receiver);
    for item in list_items(vm, list) {
        let result = vm.call_nested(args[0], &[item])?;
        if result.is_falsey() {
            return Ok(Value::Bool(false));
        }
    }
    Ok(Value::Bool(true))
}

// ---------------------------------------------------------------------------
// String methods
// ---------------------------------------------------------------------------

fn string_length(vm: &mut Vm, receiver: Option<Value>, _args: Vec<Value>) -> NativeResult {
    let text = string_text(vm, receiver_handle(receiver));
    Ok(Value::Number(text.chars().count() as f64))
}

fn string_concat(vm: &mut Vm, receiver: Option<Value>, args: Vec<Value>) -> NativeResult {
    let text = string_text(vm, receiver_handle(receiver));
    let other = want_string(vm, args[0], "concat argument")?;
    Ok(vm.alloc_string(&format!("{text}{other}")))
}

fn string_ends_with(vm: &mut Vm, receiver: Option<Value>, args: Vec<Value>) -> NativeResult {
    let text = string_text(vm, receiver_handle(receiver));
    let suffix = want_string(vm, args[0], "endsWith argument")?;
    Ok(Value::Bool(text.ends_with(&suffix)))
}

fn string_starts_with(vm: &mut Vm, receiver: Option<Value>, args: Vec<Value>) -> NativeResult {
    let text = string_text(vm, receiver_handle(receiver));
    let prefix = want_string(vm, args[0], "startsWith argument")?;
    Ok(Value::Bool(text.starts_with(&prefix)))
}

fn string_index_of(vm: &mut Vm, receiver: Option<Value>, args: Vec<Value>) -> NativeResult {
    let text = string_text(vm, receiver_handle(receiver));
    let needle = want_string(vm, args[0], "indexOf argument")?;
    match text.find(&needle) {
        Some(byte_index) => Ok(Value::Number(text[..byte_index].chars().count() as f64)),
        None => Ok(Value::Number(-1.0)),
    }
}

fn string_last_index_of(vm: &mut Vm, receiver: Option<Value>, args: Vec<Value>) -> NativeResult {
    let text = string_text(vm, receiver_handle(receiver));
    let needle = want_string(vm, args[0], "lastIndexOf argument")?;
    match text.rfind(&needle) {
        Some(byte_index) => Ok(Value::Number(text[..byte_index].chars().count() as f64)),
        None => Ok(Value::Number(-1.0)),
    }
}

fn string_iterator(vm: &mut Vm, receiver: Option<Value>, _args: Vec<Value>) -> NativeResult {
    let data = receiver.unwrap_or(Value::Null);
    Ok(make_iterator(vm, data))
}

fn string_parse_number(vm: &mut Vm, receiver: Option<Value>, _args: Vec<Value>) -> NativeResult {
    let text = string_text(vm, receiver_handle(receiver));
    match text.trim().parse::<f64>() {
        Ok(n) => Ok(Value::Number(n)),
        Err(_) => Ok(Value::Null),
    }
}

fn string_repeat(vm: &mut Vm, receiver: Option<Value>, args: Vec<Value>) -> NativeResult {
    let text = string_text(vm, receiver_handle(receiver));
    let count = want_whole(vm, args[0], "repeat count")?;
    if count < 0 {
        return Err(vm.native_exception(Exc::Type, "repeat count must not be negative."));
    }
    Ok(vm.alloc_string(&text.repeat(count as usize)))
}

fn string_substring(vm: &mut Vm, receiver: Option<Value>, args: Vec<Value>) -> NativeResult {
    let text = string_text(vm, receiver_handle(receiver));
    let chars: Vec<char> = text.chars().collect();
    let len = chars.len() as i64;
    let mut start = want_whole(vm, args[0], "substring start")?;
    let mut end = want_whole(vm, args[1], "substring end")?;
    if start < 0 {
        start += len;
    }
    if end < 0 {
        end += len;
    }
    let start = start.clamp(0, len) as usize;
    let end = end.clamp(0, len) as usize;
    let slice: String = if start < end {
        chars[start..end].iter().collect()
    } else {
        String::new()
    };
    Ok(vm.alloc_string(&slice))
}
