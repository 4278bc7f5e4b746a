//! The stack-based bytecode virtual machine.
//!
//! This module owns all runtime state: the value stack, the call-frame
//! stack, the heap, the module list, and the captured output. The central
//! fetch/decode/execute loop ([`Vm::run_loop`]) serves two drive modes: the
//! top-level drive runs until the outermost frame returns, and a nested
//! drive ([`Vm::call_nested`]) lets native functions evaluate language
//! callables, stopping when the frame count returns to its entry depth.
//!
//! Recoverable failures never cross this module as Rust errors. Every
//! operator misuse, bad index or missing variable builds a language-level
//! exception instance and unwinds the frame stack looking for an armed
//! `try`; only an *uncaught* exception (or a compile/file failure during
//! `import`) surfaces as [`Error`].

use std::path::PathBuf;
use std::time::Instant;

use tracing::{debug, enabled, trace, Level};

use crate::builtins;
use crate::bytecode::{disassemble, OpCode};
use crate::compiler::compile;
use crate::error::{Error, Result};
use crate::heap::Heap;
use crate::methods::{self, Builtins, Names};
use crate::modules::{FileLoader, Module, ModuleId};
use crate::object::{
    Obj, ObjBoundMethod, ObjClosure, ObjInstance, ObjList, ObjNative, Upvalue,
};
use crate::table::Table;
use crate::value::{number_to_string, ObjRef, Value};

/// Hard cap on call frames unless overridden by the embedder.
pub const DEFAULT_MAX_FRAMES: usize = 1024;

const INITIAL_FRAME_CAPACITY: usize = 64;
const STACK_SLOTS_PER_FRAME: usize = 256;

/// How a native function failed.
pub enum NativeError {
    /// A language-level exception to unwind with.
    Exception(Value),
    /// An exception was already unwound to an outer frame during a nested
    /// drive; the native must abandon its work silently.
    Unwound,
    /// A non-catchable failure (uncaught exception, import problems).
    Fatal(Error),
}

pub type NativeResult = std::result::Result<Value, NativeError>;

/// The calling convention for built-in functions: the VM, the bound
/// receiver (for method natives), and the argument values.
pub type NativeFn = fn(&mut Vm, Option<Value>, Vec<Value>) -> NativeResult;

/// The built-in exception classes the VM itself throws.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Exc {
    Type,
    Arity,
    Property,
    Index,
    UndefinedVariable,
    StackOverflow,
}

impl Exc {
    pub(crate) fn class_name(self) -> &'static str {
        match self {
            Exc::Type => "TypeException",
            Exc::Arity => "ArityException",
            Exc::Property => "PropertyException",
            Exc::Index => "IndexException",
            Exc::UndefinedVariable => "UndefinedVariableException",
            Exc::StackOverflow => "StackOverflowException",
        }
    }
}

/// One active call.
struct CallFrame {
    closure: ObjRef,
    /// The closure's function, cached to avoid a double lookup per fetch.
    function: ObjRef,
    /// The closure's owning module, cached for global resolution.
    module: ModuleId,
    ip: usize,
    /// Index of slot 0 (the callee/receiver) in the value stack.
    base: usize,
    /// Armed by `TRY_BEGIN`, cleared by `TRY_END` or by taking the catch.
    is_try: bool,
    catch_ip: usize,
    /// Stack height at `TRY_BEGIN`; the unwinder restores it before
    /// pushing the exception.
    try_stack: usize,
}

pub struct Vm {
    pub(crate) heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    /// Open upvalues as `(stack slot, upvalue)`, ascending by slot. At most
    /// one open upvalue exists per slot.
    open_upvalues: Vec<(usize, ObjRef)>,
    pub(crate) modules: Vec<Module>,
    entry_module: ModuleId,
    /// Cached import objects keyed by interned path.
    import_cache: Table,
    /// Globals every new module starts from.
    baseline_globals: Table,
    pub(crate) builtins: Builtins,
    pub(crate) names: Names,
    /// Interned strings that must survive every collection.
    pinned: Vec<ObjRef>,
    /// Scratch roots for natives building structures mid-allocation.
    pub(crate) temp_roots: Vec<Value>,
    /// Bumped every time the unwinder lands in a catch handler; paired with
    /// the handler's frame depth so nested drives can tell "the callee
    /// returned" apart from "an exception was caught at or below my entry
    /// depth".
    unwind_serial: u64,
    unwind_depth: usize,
    /// Captured `print` output.
    output: Vec<String>,
    directory: PathBuf,
    loader: Box<dyn FileLoader>,
    max_frames: usize,
    start_time: Instant,
}

impl Vm {
    pub(crate) fn new(directory: PathBuf, loader: Box<dyn FileLoader>, max_frames: usize) -> Self {
        let mut heap = Heap::new();
        let (builtins, names, mut pinned) = methods::bootstrap(&mut heap);
        let mut baseline_globals = Table::new();
        builtins::register_globals(&mut heap, &builtins, &mut baseline_globals, &mut pinned);

        let mut vm = Vm {
            heap,
            stack: Vec::with_capacity(INITIAL_FRAME_CAPACITY * STACK_SLOTS_PER_FRAME),
            frames: Vec::with_capacity(INITIAL_FRAME_CAPACITY),
            open_upvalues: Vec::new(),
            modules: Vec::new(),
            entry_module: ModuleId(0),
            import_cache: Table::new(),
            baseline_globals,
            builtins,
            names,
            pinned,
            temp_roots: Vec::new(),
            unwind_serial: 0,
            unwind_depth: 0,
            output: Vec::new(),
            directory,
            loader,
            max_frames,
            start_time: Instant::now(),
        };
        vm.entry_module = vm.new_module("$main$");
        vm.heap.gc_enabled = true;
        vm
    }

    /// Create a module pre-seeded with the baseline globals and its
    /// `THIS_MODULE` name. Must run with collection disabled.
    fn new_module(&mut self, path: &str) -> ModuleId {
        let id = ModuleId(self.modules.len());
        let mut module = Module::new(path);
        module.globals = self.baseline_globals.clone();
        let path_value = self.heap.intern(path);
        let key = self.names.this_module;
        let hash = self.heap.str_hash(key);
        module.globals.set(key, hash, Value::Obj(path_value));
        self.modules.push(module);
        id
    }

    // -----------------------------------------------------------------------
    // Embedding surface
    // -----------------------------------------------------------------------

    /// Compile and execute one script in the entry module. Globals persist
    /// between calls, which is what gives a REPL its memory.
    pub(crate) fn interpret(&mut self, source: &str) -> Result<()> {
        self.heap.gc_enabled = false;
        let function = match compile(source, &mut self.heap) {
            Ok(function) => function,
            Err(err) => {
                self.heap.gc_enabled = true;
                return Err(err);
            }
        };
        if enabled!(Level::TRACE)
            && let Obj::Function(f) = self.heap.get(function)
        {
            trace!("\n{}", disassemble(&f.chunk, &self.heap, "script"));
        }
        let closure = self.heap.alloc(Obj::Closure(ObjClosure {
            function,
            upvalues: Vec::new(),
            module: self.entry_module,
        }));
        self.push(Value::Obj(closure));
        self.heap.gc_enabled = true;

        let outcome = self
            .call_value(0)
            .and_then(|()| self.run_loop(0));
        match outcome {
            Ok(()) => {
                self.pop(); // the script's implicit null
                Ok(())
            }
            Err(err) => {
                // Leave the VM reusable after a runtime failure.
                self.stack.clear();
                self.frames.clear();
                self.open_upvalues.clear();
                Err(err)
            }
        }
    }

    pub(crate) fn take_output(&mut self) -> Vec<String> {
        std::mem::take(&mut self.output)
    }

    pub(crate) fn print_line(&mut self, line: String) {
        self.output.push(line);
    }

    /// Install a host function as a global of the entry module.
    pub(crate) fn define_native(&mut self, name: &str, arity: u8, varargs: bool, func: NativeFn) {
        self.heap.gc_enabled = false;
        let name_ref = self.heap.intern(name);
        self.pinned.push(name_ref);
        let native = self.heap.alloc(Obj::Native(ObjNative {
            name: name_ref,
            func,
            arity,
            varargs,
            receiver: None,
        }));
        let hash = self.heap.str_hash(name_ref);
        self.modules[self.entry_module.0]
            .globals
            .set(name_ref, hash, Value::Obj(native));
        self.heap.gc_enabled = true;
    }

    pub(crate) fn clock_seconds(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    // -----------------------------------------------------------------------
    // Stack and frame helpers
    // -----------------------------------------------------------------------

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or(Value::Null)
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("no active frame")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no active frame")
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("no active frame");
        let ip = frame.ip;
        frame.ip += 1;
        let function = frame.function;
        match self.heap.get(function) {
            Obj::Function(f) => f.chunk.code[ip],
            _ => unreachable!("frame function is not a function"),
        }
    }

    fn read_u16(&mut self) -> usize {
        let hi = self.read_byte() as usize;
        let lo = self.read_byte() as usize;
        (hi << 8) | lo
    }

    fn read_uleb(&mut self) -> u32 {
        let mut result = 0u32;
        let mut shift = 0;
        loop {
            let byte = self.read_byte();
            result |= ((byte & 0x7f) as u32) << shift;
            if byte & 0x80 == 0 {
                return result;
            }
            shift += 7;
        }
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_uleb() as usize;
        let function = self.frame().function;
        match self.heap.get(function) {
            Obj::Function(f) => f.chunk.constants[index],
            _ => unreachable!("frame function is not a function"),
        }
    }

    /// Read a constant known to be an interned string (a name operand).
    fn read_str_constant(&mut self) -> ObjRef {
        match self.read_constant() {
            Value::Obj(handle) => handle,
            _ => unreachable!("name operand is not a string constant"),
        }
    }

    fn current_line(&self) -> u32 {
        let frame = self.frame();
        match self.heap.get(frame.function) {
            Obj::Function(f) => f.chunk.line_at(frame.ip.saturating_sub(1)),
            _ => 0,
        }
    }

    // -----------------------------------------------------------------------
    // Allocation entry points (collection happens here)
    // -----------------------------------------------------------------------

    pub(crate) fn alloc(&mut self, obj: Obj) -> ObjRef {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.alloc(obj)
    }

    pub(crate) fn intern(&mut self, text: &str) -> ObjRef {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.intern(text)
    }

    pub(crate) fn alloc_list(&mut self, items: Vec<Value>) -> Value {
        // The items may be reachable from nowhere else yet; root them for
        // the collection this allocation can trigger.
        if self.heap.should_collect() {
            let mark = self.temp_roots.len();
            self.temp_roots.extend_from_slice(&items);
            self.collect_garbage();
            self.temp_roots.truncate(mark);
        }
        Value::Obj(self.heap.alloc(Obj::List(ObjList { items })))
    }

    pub(crate) fn alloc_string(&mut self, text: &str) -> Value {
        Value::Obj(self.intern(text))
    }

    /// Mark every root, trace, and sweep.
    fn collect_garbage(&mut self) {
        let before = self.heap.bytes_allocated;

        for &value in &self.stack {
            self.heap.mark_value(value);
        }
        for &value in &self.temp_roots {
            self.heap.mark_value(value);
        }
        for frame in &self.frames {
            self.heap.mark_object(frame.closure);
            self.heap.mark_object(frame.function);
        }
        for &(_, upvalue) in &self.open_upvalues {
            self.heap.mark_object(upvalue);
        }
        for module in &self.modules {
            self.heap.mark_table(&module.globals);
            self.heap.mark_table(&module.exports);
        }
        self.heap.mark_table(&self.import_cache);
        self.heap.mark_table(&self.baseline_globals);
        for &handle in &self.pinned {
            self.heap.mark_object(handle);
        }
        for &class in self.builtins.class_roots().iter() {
            self.heap.mark_object(class);
        }
        self.heap.mark_table(&self.builtins.list_methods);
        self.heap.mark_table(&self.builtins.string_methods);

        self.heap.trace_references();
        let (freed, freed_bytes) = self.heap.sweep();
        debug!(
            freed,
            freed_bytes,
            live_bytes = self.heap.bytes_allocated,
            before_bytes = before,
            "collected garbage"
        );
    }

    // -----------------------------------------------------------------------
    // The interpreter loop
    // -----------------------------------------------------------------------

    /// Fetch/decode/execute until the frame count drops to `exit_depth`.
    fn run_loop(&mut self, exit_depth: usize) -> Result<()> {
        while self.frames.len() > exit_depth {
            let op = OpCode::try_from(self.read_byte()).expect("invalid opcode byte");
            match op {
                OpCode::Constant => {
                    let value = self.read_constant();
                    self.push(value);
                }
                OpCode::Null => self.push(Value::Null),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Object => self.push(Value::Obj(self.builtins.object_class)),
                OpCode::List => {
                    let count = self.read_byte() as usize;
                    let start = self.stack.len() - count;
                    let items = self.stack[start..].to_vec();
                    let list = self.alloc_list(items);
                    self.stack.truncate(start);
                    self.push(list);
                }
                OpCode::Range => self.op_range()?,
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::Dup => self.push(self.peek(0)),
                OpCode::DupTwo => {
                    let (a, b) = (self.peek(1), self.peek(0));
                    self.push(a);
                    self.push(b);
                }
                OpCode::Swap => {
                    let len = self.stack.len();
                    self.stack.swap(len - 1, len - 2);
                }

                OpCode::GetGlobal => {
                    let name = self.read_str_constant();
                    let hash = self.heap.str_hash(name);
                    let module = self.frame().module;
                    match self.modules[module.0].globals.get(name, hash) {
                        Some(value) => self.push(value),
                        None => {
                            let text = self.heap.str_value(name).to_string();
                            self.throw(Exc::UndefinedVariable, format!("Undefined variable '{text}'."))?;
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_str_constant();
                    let hash = self.heap.str_hash(name);
                    let module = self.frame().module;
                    let value = self.pop();
                    self.modules[module.0].globals.set(name, hash, value);
                }
                OpCode::SetGlobal => {
                    let name = self.read_str_constant();
                    let hash = self.heap.str_hash(name);
                    let module = self.frame().module;
                    if self.modules[module.0].globals.contains(name, hash) {
                        let value = self.peek(0);
                        self.modules[module.0].globals.set(name, hash, value);
                    } else {
                        let text = self.heap.str_value(name).to_string();
                        self.throw(Exc::UndefinedVariable, format!("Undefined variable '{text}'."))?;
                    }
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().base;
                    self.push(self.stack[base + slot]);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().base;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetUpvalue => {
                    let index = self.read_byte() as usize;
                    let upvalue = self.frame_upvalue(index);
                    let value = match self.heap.upvalue(upvalue) {
                        Upvalue::Open(slot) => self.stack[slot],
                        Upvalue::Closed(value) => value,
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let index = self.read_byte() as usize;
                    let upvalue = self.frame_upvalue(index);
                    let value = self.peek(0);
                    match self.heap.upvalue(upvalue) {
                        Upvalue::Open(slot) => self.stack[slot] = value,
                        Upvalue::Closed(_) => self.heap.set_upvalue(upvalue, Upvalue::Closed(value)),
                    }
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }

                OpCode::GetProperty => {
                    let name = self.read_str_constant();
                    self.op_get_property(name)?;
                }
                OpCode::SetProperty => {
                    let name = self.read_str_constant();
                    self.op_set_property(name, false)?;
                }
                OpCode::SetPropertyKv => {
                    let name = self.read_str_constant();
                    self.op_set_property(name, true)?;
                }
                OpCode::GetIndex => self.op_get_index()?,
                OpCode::SetIndex => self.op_set_index()?,
                OpCode::GetSuper => {
                    let name = self.read_str_constant();
                    self.op_get_super(name)?;
                }

                OpCode::Negate => {
                    match self.peek(0).as_number() {
                        Some(n) => {
                            self.pop();
                            self.push(Value::Number(-n));
                        }
                        None => self.throw(Exc::Type, "Operand must be a number.".into())?,
                    }
                }
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                OpCode::BitNot => {
                    match self.peek(0).as_whole_number() {
                        Some(n) => {
                            self.pop();
                            self.push(Value::Number(!n as f64));
                        }
                        None => self.throw(Exc::Type, "Operand must be a whole number.".into())?,
                    }
                }
                OpCode::Add => self.op_add()?,
                OpCode::Subtract => self.arithmetic_op(op)?,
                OpCode::Multiply => self.arithmetic_op(op)?,
                OpCode::Divide => self.arithmetic_op(op)?,
                OpCode::Modulo => self.arithmetic_op(op)?,
                OpCode::BitAnd | OpCode::BitOr | OpCode::BitXor => self.integer_op(op)?,
                OpCode::Shl | OpCode::Shr | OpCode::Ushr => self.shift_op(op)?,
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(self.heap.values_equal(a, b)));
                }
                OpCode::NotEqual => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(!self.heap.values_equal(a, b)));
                }
                OpCode::Is => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Greater | OpCode::GreaterEqual | OpCode::Less | OpCode::LessEqual => {
                    self.comparison_op(op)?;
                }
                OpCode::In => self.op_in()?,
                OpCode::Instanceof => self.op_instanceof()?,
                OpCode::Typeof => {
                    let value = self.pop();
                    let name = self.heap.type_name(value);
                    let interned = self.intern(name);
                    self.push(Value::Obj(interned));
                }

                OpCode::Jump => {
                    let offset = self.read_u16();
                    self.frame_mut().ip += offset;
                }
                OpCode::Loop => {
                    let offset = self.read_u16();
                    self.frame_mut().ip -= offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16();
                    if self.pop().is_falsey() {
                        self.frame_mut().ip += offset;
                    }
                }
                OpCode::JumpIfFalseSc => {
                    let offset = self.read_u16();
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset;
                    }
                }

                OpCode::Call => {
                    let argc = self.read_byte() as usize;
                    self.call_value(argc)?;
                }
                OpCode::Closure => self.op_closure()?,
                OpCode::Class => {
                    let name = self.read_str_constant();
                    let methods = match self.heap.get(self.builtins.object_class) {
                        Obj::Class(object) => object.methods.clone(),
                        _ => unreachable!("object class handle is not a class"),
                    };
                    let class = self.alloc(Obj::Class(crate::object::ObjClass {
                        name,
                        methods,
                        superclass: Some(self.builtins.object_class),
                    }));
                    self.push(Value::Obj(class));
                }
                OpCode::Inherit => self.op_inherit()?,
                OpCode::Method => {
                    let name = self.read_str_constant();
                    let hash = self.heap.str_hash(name);
                    let method = self.peek(0);
                    let class = self.peek(1);
                    if let Value::Obj(class_ref) = class
                        && let Obj::Class(c) = self.heap.get_mut(class_ref)
                    {
                        c.methods.set(name, hash, method);
                    }
                    self.pop();
                }
                OpCode::Invoke => {
                    let name = self.read_str_constant();
                    let argc = self.read_byte() as usize;
                    self.op_invoke(name, argc)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_str_constant();
                    let argc = self.read_byte() as usize;
                    self.op_super_invoke(name, argc)?;
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("return without a frame");
                    self.close_upvalues(frame.base);
                    self.stack.truncate(frame.base);
                    self.push(result);
                }

                OpCode::Throw => {
                    let value = self.pop();
                    if self.is_exception_instance(value) {
                        self.throw_value(value)?;
                    } else {
                        self.throw(Exc::Type, "Can only throw Exception instances.".into())?;
                    }
                }
                OpCode::TryBegin => {
                    let offset = self.read_u16();
                    let stack_len = self.stack.len();
                    let frame = self.frame_mut();
                    frame.is_try = true;
                    frame.catch_ip = frame.ip + offset;
                    frame.try_stack = stack_len;
                }
                OpCode::TryEnd => {
                    self.frame_mut().is_try = false;
                }

                OpCode::Import => {
                    let name = self.read_str_constant();
                    self.op_import(name)?;
                }
                OpCode::Export => {
                    let name = self.read_str_constant();
                    let hash = self.heap.str_hash(name);
                    let module = self.frame().module;
                    let value = self.pop();
                    self.modules[module.0].exports.set(name, hash, value);
                }
            }
        }
        Ok(())
    }

    fn frame_upvalue(&self, index: usize) -> ObjRef {
        let closure = self.frame().closure;
        match self.heap.get(closure) {
            Obj::Closure(c) => c.upvalues[index],
            _ => unreachable!("frame closure is not a closure"),
        }
    }

    // -----------------------------------------------------------------------
    // Operator implementations
    // -----------------------------------------------------------------------

    /// `+`: list append, string concatenation (stringifying the other
    /// operand, left first so an instance's `toString` observes
    /// left-to-right order), or numeric addition.
    fn op_add(&mut self) -> Result<()> {
        let b = self.peek(0);
        let a = self.peek(1);

        if let Value::Obj(ra) = a
            && matches!(self.heap.get(ra), Obj::List(_))
        {
            let mut items = match self.heap.get(ra) {
                Obj::List(list) => list.items.clone(),
                _ => unreachable!(),
            };
            items.push(b);
            let result = self.alloc_list(items);
            self.pop();
            self.pop();
            self.push(result);
            return Ok(());
        }

        let a_is_str = matches!(a, Value::Obj(r) if matches!(self.heap.get(r), Obj::Str(_)));
        let b_is_str = matches!(b, Value::Obj(r) if matches!(self.heap.get(r), Obj::Str(_)));
        if a_is_str || b_is_str {
            let left = match self.stringify(a) {
                Ok(text) => text,
                Err(err) => return self.handle_native_error(err),
            };
            let right = match self.stringify(b) {
                Ok(text) => text,
                Err(err) => return self.handle_native_error(err),
            };
            let result = self.alloc_string(&format!("{left}{right}"));
            self.pop();
            self.pop();
            self.push(result);
            return Ok(());
        }

        match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => {
                self.pop();
                self.pop();
                self.push(Value::Number(x + y));
                Ok(())
            }
            _ => self.throw(
                Exc::Type,
                "Operands must be numbers, strings, or a list and an element.".into(),
            ),
        }
    }

    fn arithmetic_op(&mut self, op: OpCode) -> Result<()> {
        let (Some(a), Some(b)) = (self.peek(1).as_number(), self.peek(0).as_number()) else {
            return self.throw(Exc::Type, "Operands must be numbers.".into());
        };
        self.pop();
        self.pop();
        let result = match op {
            OpCode::Subtract => a - b,
            OpCode::Multiply => a * b,
            OpCode::Divide => a / b,
            OpCode::Modulo => a % b,
            _ => unreachable!("not an arithmetic opcode"),
        };
        self.push(Value::Number(result));
        Ok(())
    }

    fn comparison_op(&mut self, op: OpCode) -> Result<()> {
        let (Some(a), Some(b)) = (self.peek(1).as_number(), self.peek(0).as_number()) else {
            return self.throw(Exc::Type, "Operands must be numbers.".into());
        };
        self.pop();
        self.pop();
        let result = match op {
            OpCode::Greater => a > b,
            OpCode::GreaterEqual => a >= b,
            OpCode::Less => a < b,
            OpCode::LessEqual => a <= b,
            _ => unreachable!("not a comparison opcode"),
        };
        self.push(Value::Bool(result));
        Ok(())
    }

    fn integer_op(&mut self, op: OpCode) -> Result<()> {
        let (Some(a), Some(b)) = (
            self.peek(1).as_whole_number(),
            self.peek(0).as_whole_number(),
        ) else {
            return self.throw(Exc::Type, "Operands must be whole numbers.".into());
        };
        self.pop();
        self.pop();
        let result = match op {
            OpCode::BitAnd => a & b,
            OpCode::BitOr => a | b,
            OpCode::BitXor => a ^ b,
            _ => unreachable!("not an integer opcode"),
        };
        self.push(Value::Number(result as f64));
        Ok(())
    }

    fn shift_op(&mut self, op: OpCode) -> Result<()> {
        let (Some(a), Some(b)) = (
            self.peek(1).as_whole_number(),
            self.peek(0).as_whole_number(),
        ) else {
            return self.throw(Exc::Type, "Operands must be whole numbers.".into());
        };
        if b < 0 {
            return self.throw(Exc::Type, "Shift count must not be negative.".into());
        }
        self.pop();
        self.pop();
        let count = (b as u32) & 63;
        let result = match op {
            OpCode::Shl => (a << count) as f64,
            OpCode::Shr => (a >> count) as f64,
            // Logical shift: both operands reinterpreted as unsigned.
            OpCode::Ushr => ((a as u64) >> count) as f64,
            _ => unreachable!("not a shift opcode"),
        };
        self.push(Value::Number(result));
        Ok(())
    }

    fn op_range(&mut self) -> Result<()> {
        let (Some(lo), Some(hi)) = (
            self.peek(1).as_whole_number(),
            self.peek(0).as_whole_number(),
        ) else {
            return self.throw(Exc::Type, "Range bounds must be whole numbers.".into());
        };
        let items: Vec<Value> = if lo <= hi {
            (lo..=hi).map(|n| Value::Number(n as f64)).collect()
        } else {
            (hi..=lo).rev().map(|n| Value::Number(n as f64)).collect()
        };
        let list = self.alloc_list(items);
        self.pop();
        self.pop();
        self.push(list);
        Ok(())
    }

    fn op_in(&mut self) -> Result<()> {
        let container = self.peek(0);
        let element = self.peek(1);
        let result = match container {
            Value::Obj(rc) => match self.heap.get(rc) {
                Obj::List(list) => list
                    .items
                    .iter()
                    .any(|&item| self.heap.values_equal(item, element)),
                Obj::Str(text) => match element {
                    Value::Obj(re) => match self.heap.get(re) {
                        Obj::Str(needle) => text.chars.contains(&*needle.chars),
                        _ => {
                            return self
                                .throw(Exc::Type, "Substring check requires a string.".into());
                        }
                    },
                    _ => return self.throw(Exc::Type, "Substring check requires a string.".into()),
                },
                Obj::Instance(instance) => match element {
                    Value::Obj(re) if matches!(self.heap.get(re), Obj::Str(_)) => {
                        let hash = self.heap.str_hash(re);
                        instance.fields.contains(re, hash)
                    }
                    _ => return self.throw(Exc::Type, "Field check requires a string key.".into()),
                },
                _ => {
                    return self.throw(
                        Exc::Type,
                        "'in' requires a list, string or instance on the right.".into(),
                    );
                }
            },
            _ => {
                return self.throw(
                    Exc::Type,
                    "'in' requires a list, string or instance on the right.".into(),
                );
            }
        };
        self.pop();
        self.pop();
        self.push(Value::Bool(result));
        Ok(())
    }

    fn op_instanceof(&mut self) -> Result<()> {
        let class = self.peek(0);
        let value = self.peek(1);
        let Value::Obj(class_ref) = class else {
            return self.throw(Exc::Type, "Right operand of 'instanceof' must be a class.".into());
        };
        if !matches!(self.heap.get(class_ref), Obj::Class(_)) {
            return self.throw(Exc::Type, "Right operand of 'instanceof' must be a class.".into());
        }
        let mut result = false;
        if let Value::Obj(r) = value
            && let Obj::Instance(instance) = self.heap.get(r)
        {
            let mut current = Some(instance.class);
            while let Some(c) = current {
                if c == class_ref {
                    result = true;
                    break;
                }
                current = match self.heap.get(c) {
                    Obj::Class(class) => class.superclass,
                    _ => None,
                };
            }
        }
        self.pop();
        self.pop();
        self.push(Value::Bool(result));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Properties, indexing, methods
    // -----------------------------------------------------------------------

    fn op_get_property(&mut self, name: ObjRef) -> Result<()> {
        let receiver = self.peek(0);
        let hash = self.heap.str_hash(name);
        let Value::Obj(r) = receiver else {
            return self.throw(Exc::Type, "Only instances have properties.".into());
        };
        match self.heap.get(r) {
            Obj::Instance(instance) => {
                if let Some(field) = instance.fields.get(name, hash) {
                    self.pop();
                    self.push(field);
                    return Ok(());
                }
                let class = instance.class;
                let method = match self.heap.get(class) {
                    Obj::Class(c) => c.methods.get(name, hash),
                    _ => None,
                };
                match method {
                    Some(method) => self.bind_and_replace(receiver, method),
                    None => {
                        let text = self.heap.str_value(name).to_string();
                        self.throw(Exc::Property, format!("Undefined property '{text}'."))
                    }
                }
            }
            Obj::List(_) => match self.builtins.list_methods.get(name, hash) {
                Some(method) => self.bind_and_replace(receiver, method),
                None => {
                    let text = self.heap.str_value(name).to_string();
                    self.throw(Exc::Property, format!("Undefined property '{text}'."))
                }
            },
            Obj::Str(_) => match self.builtins.string_methods.get(name, hash) {
                Some(method) => self.bind_and_replace(receiver, method),
                None => {
                    let text = self.heap.str_value(name).to_string();
                    self.throw(Exc::Property, format!("Undefined property '{text}'."))
                }
            },
            _ => self.throw(Exc::Type, "Only instances have properties.".into()),
        }
    }

    /// Replace the receiver on top of the stack with `method` bound to it.
    fn bind_and_replace(&mut self, receiver: Value, method: Value) -> Result<()> {
        let Value::Obj(m) = method else {
            // A non-callable stored in a method table is still a value.
            self.pop();
            self.push(method);
            return Ok(());
        };
        let bound = match self.heap.get(m) {
            Obj::Closure(_) => self.alloc(Obj::BoundMethod(ObjBoundMethod {
                receiver,
                method: m,
            })),
            Obj::Native(native) => {
                let (name, func, arity, varargs) =
                    (native.name, native.func, native.arity, native.varargs);
                self.alloc(Obj::Native(ObjNative {
                    name,
                    func,
                    arity,
                    varargs,
                    receiver: Some(receiver),
                }))
            }
            _ => {
                self.pop();
                self.push(method);
                return Ok(());
            }
        };
        self.pop();
        self.push(Value::Obj(bound));
        Ok(())
    }

    fn op_set_property(&mut self, name: ObjRef, keep_receiver: bool) -> Result<()> {
        let value = self.peek(0);
        let receiver = self.peek(1);
        let hash = self.heap.str_hash(name);
        let Value::Obj(r) = receiver else {
            return self.throw(Exc::Type, "Only instances have fields.".into());
        };
        match self.heap.get_mut(r) {
            Obj::Instance(instance) => {
                instance.fields.set(name, hash, value);
                if keep_receiver {
                    // Object-literal building: drop the value, keep the
                    // instance below for the next field.
                    self.pop();
                } else {
                    self.pop();
                    self.pop();
                    self.push(value);
                }
                Ok(())
            }
            _ => self.throw(Exc::Type, "Only instances have fields.".into()),
        }
    }

    fn op_get_index(&mut self) -> Result<()> {
        let index = self.peek(0);
        let target = self.peek(1);
        let Value::Obj(r) = target else {
            return self.throw(Exc::Type, "Only lists and strings can be indexed.".into());
        };
        match self.heap.get(r) {
            Obj::List(list) => {
                let Some(i) = index.as_whole_number() else {
                    return self.throw(Exc::Type, "List index must be a whole number.".into());
                };
                let len = list.items.len() as i64;
                let actual = if i < 0 { i + len } else { i };
                if actual < 0 || actual >= len {
                    return self.throw(Exc::Index, format!("Index {i} out of bounds."));
                }
                let value = list.items[actual as usize];
                self.pop();
                self.pop();
                self.push(value);
                Ok(())
            }
            Obj::Str(_) => {
                let Some(i) = index.as_whole_number() else {
                    return self.throw(Exc::Type, "String index must be a whole number.".into());
                };
                let text = match self.heap.get(r) {
                    Obj::Str(s) => &s.chars,
                    _ => unreachable!(),
                };
                let len = text.chars().count() as i64;
                let actual = if i < 0 { i + len } else { i };
                if actual < 0 || actual >= len {
                    return self.throw(Exc::Index, format!("Index {i} out of bounds."));
                }
                let ch = text.chars().nth(actual as usize).expect("index checked");
                let value = self.alloc_string(&ch.to_string());
                self.pop();
                self.pop();
                self.push(value);
                Ok(())
            }
            _ => self.throw(Exc::Type, "Only lists and strings can be indexed.".into()),
        }
    }

    fn op_set_index(&mut self) -> Result<()> {
        let value = self.peek(0);
        let index = self.peek(1);
        let target = self.peek(2);
        let Value::Obj(r) = target else {
            return self.throw(Exc::Type, "Only lists support index assignment.".into());
        };
        let Some(i) = index.as_whole_number() else {
            return self.throw(Exc::Type, "List index must be a whole number.".into());
        };
        match self.heap.get_mut(r) {
            Obj::List(list) => {
                let len = list.items.len() as i64;
                let actual = if i < 0 { i + len } else { i };
                if actual < 0 || actual >= len {
                    return self.throw(Exc::Index, format!("Index {i} out of bounds."));
                }
                list.items[actual as usize] = value;
                self.pop();
                self.pop();
                self.pop();
                self.push(value);
                Ok(())
            }
            _ => self.throw(Exc::Type, "Only lists support index assignment.".into()),
        }
    }

    fn op_get_super(&mut self, name: ObjRef) -> Result<()> {
        let superclass = self.pop();
        let receiver = self.peek(0);
        let hash = self.heap.str_hash(name);
        let method = match superclass {
            Value::Obj(r) => match self.heap.get(r) {
                Obj::Class(class) => class.methods.get(name, hash),
                _ => None,
            },
            _ => None,
        };
        match method {
            Some(method) => self.bind_and_replace(receiver, method),
            None => {
                let text = self.heap.str_value(name).to_string();
                self.throw(Exc::Property, format!("Undefined property '{text}'."))
            }
        }
    }

    fn op_invoke(&mut self, name: ObjRef, argc: usize) -> Result<()> {
        let receiver = self.peek(argc);
        let hash = self.heap.str_hash(name);
        let Value::Obj(r) = receiver else {
            return self.throw(Exc::Type, "Only instances, lists and strings have methods.".into());
        };
        match self.heap.get(r) {
            Obj::Instance(instance) => {
                // Fields shadow methods; a callable field is called with no
                // implicit receiver.
                if let Some(field) = instance.fields.get(name, hash) {
                    let slot = self.stack.len() - argc - 1;
                    self.stack[slot] = field;
                    return self.call_value(argc);
                }
                let class = instance.class;
                let method = match self.heap.get(class) {
                    Obj::Class(c) => c.methods.get(name, hash),
                    _ => None,
                };
                match method {
                    Some(method) => self.call_method_value(method, argc, receiver),
                    None => {
                        let text = self.heap.str_value(name).to_string();
                        self.throw(Exc::Property, format!("Undefined property '{text}'."))
                    }
                }
            }
            Obj::List(_) => match self.builtins.list_methods.get(name, hash) {
                Some(method) => self.call_method_value(method, argc, receiver),
                None => {
                    let text = self.heap.str_value(name).to_string();
                    self.throw(Exc::Property, format!("Undefined property '{text}'."))
                }
            },
            Obj::Str(_) => match self.builtins.string_methods.get(name, hash) {
                Some(method) => self.call_method_value(method, argc, receiver),
                None => {
                    let text = self.heap.str_value(name).to_string();
                    self.throw(Exc::Property, format!("Undefined property '{text}'."))
                }
            },
            _ => self.throw(Exc::Type, "Only instances, lists and strings have methods.".into()),
        }
    }

    fn op_super_invoke(&mut self, name: ObjRef, argc: usize) -> Result<()> {
        let superclass = self.pop();
        let receiver = self.peek(argc);
        let hash = self.heap.str_hash(name);
        let method = match superclass {
            Value::Obj(r) => match self.heap.get(r) {
                Obj::Class(class) => class.methods.get(name, hash),
                _ => None,
            },
            _ => None,
        };
        match method {
            Some(method) => self.call_method_value(method, argc, receiver),
            None => {
                let text = self.heap.str_value(name).to_string();
                self.throw(Exc::Property, format!("Undefined property '{text}'."))
            }
        }
    }

    /// Dispatch a method-table entry: closures keep the receiver in slot 0,
    /// natives get it passed directly.
    fn call_method_value(&mut self, method: Value, argc: usize, receiver: Value) -> Result<()> {
        match method {
            Value::Obj(m) => match self.heap.get(m) {
                Obj::Closure(_) => self.call_closure(m, argc),
                Obj::Native(_) => self.call_native(m, argc, Some(receiver)),
                _ => self.throw(Exc::Type, "Can only call functions and classes.".into()),
            },
            _ => self.throw(Exc::Type, "Can only call functions and classes.".into()),
        }
    }

    fn op_inherit(&mut self) -> Result<()> {
        let class = self.peek(0);
        let superclass = self.peek(1);
        let Value::Obj(super_ref) = superclass else {
            return self.throw(Exc::Type, "Superclass must be a class.".into());
        };
        let super_methods = match self.heap.get(super_ref) {
            Obj::Class(c) => c.methods.clone(),
            _ => return self.throw(Exc::Type, "Superclass must be a class.".into()),
        };
        if let Value::Obj(class_ref) = class
            && let Obj::Class(c) = self.heap.get_mut(class_ref)
        {
            c.methods.add_all(&super_methods);
            c.superclass = Some(super_ref);
        }
        self.pop();
        Ok(())
    }

    fn op_closure(&mut self) -> Result<()> {
        let function = match self.read_constant() {
            Value::Obj(f) => f,
            _ => unreachable!("closure operand is not a function"),
        };
        let upvalue_count = match self.heap.get(function) {
            Obj::Function(f) => f.upvalue_count,
            _ => unreachable!("closure operand is not a function"),
        };
        let module = self.frame().module;
        let closure = self.alloc(Obj::Closure(ObjClosure {
            function,
            upvalues: Vec::with_capacity(upvalue_count),
            module,
        }));
        self.push(Value::Obj(closure));

        for _ in 0..upvalue_count {
            let is_local = self.read_byte() == 1;
            let index = self.read_byte() as usize;
            let upvalue = if is_local {
                let base = self.frame().base;
                self.capture_upvalue(base + index)
            } else {
                self.frame_upvalue(index)
            };
            match self.heap.get_mut(closure) {
                Obj::Closure(c) => c.upvalues.push(upvalue),
                _ => unreachable!(),
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Upvalues
    // -----------------------------------------------------------------------

    /// Find or create the open upvalue for `slot`, keeping the open list
    /// ordered by slot.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        match self.open_upvalues.binary_search_by_key(&slot, |&(s, _)| s) {
            Ok(position) => self.open_upvalues[position].1,
            Err(position) => {
                let upvalue = self.alloc(Obj::Upvalue(Upvalue::Open(slot)));
                self.open_upvalues.insert(position, (slot, upvalue));
                upvalue
            }
        }
    }

    /// Close every open upvalue at or above `from`: copy the stack value
    /// into the upvalue and drop it from the open list.
    fn close_upvalues(&mut self, from: usize) {
        while let Some(&(slot, upvalue)) = self.open_upvalues.last() {
            if slot < from {
                break;
            }
            let value = self.stack[slot];
            self.heap.set_upvalue(upvalue, Upvalue::Closed(value));
            self.open_upvalues.pop();
        }
    }

    // -----------------------------------------------------------------------
    // Calls
    // -----------------------------------------------------------------------

    /// Call whatever sits below `argc` arguments on the stack.
    fn call_value(&mut self, argc: usize) -> Result<()> {
        let callee = self.peek(argc);
        let Value::Obj(r) = callee else {
            return self.throw(Exc::Type, "Can only call functions and classes.".into());
        };
        match self.heap.get(r) {
            Obj::Closure(_) => self.call_closure(r, argc),
            Obj::Native(native) => {
                let receiver = native.receiver;
                self.call_native(r, argc, receiver)
            }
            Obj::Class(_) => self.call_class(r, argc),
            Obj::BoundMethod(bound) => {
                let (receiver, method) = (bound.receiver, bound.method);
                let slot = self.stack.len() - argc - 1;
                self.stack[slot] = receiver;
                self.call_closure(method, argc)
            }
            _ => self.throw(Exc::Type, "Can only call functions and classes.".into()),
        }
    }

    /// Push a frame for a closure after settling the argument count:
    /// exact for named functions, padded/truncated for lambdas, surplus
    /// packed into a list for varargs.
    fn call_closure(&mut self, closure: ObjRef, argc: usize) -> Result<()> {
        let function = match self.heap.get(closure) {
            Obj::Closure(c) => c.function,
            _ => unreachable!("callee is not a closure"),
        };
        let (arity, is_lambda, varargs) = match self.heap.get(function) {
            Obj::Function(f) => (f.arity as usize, f.is_lambda, f.varargs),
            _ => unreachable!("closure function is not a function"),
        };

        let mut argc = argc;
        if varargs {
            let required = arity.saturating_sub(1);
            if argc < required {
                if is_lambda {
                    while argc < required {
                        self.push(Value::Null);
                        argc += 1;
                    }
                } else {
                    return self.throw(
                        Exc::Arity,
                        format!("Expected at least {required} arguments but got {argc}."),
                    );
                }
            }
            let surplus = argc - required;
            let start = self.stack.len() - surplus;
            let items = self.stack[start..].to_vec();
            let rest = self.alloc_list(items);
            self.stack.truncate(start);
            self.push(rest);
        } else if is_lambda {
            while argc < arity {
                self.push(Value::Null);
                argc += 1;
            }
            while argc > arity {
                self.pop();
                argc -= 1;
            }
        } else if argc != arity {
            return self.throw(
                Exc::Arity,
                format!("Expected {arity} arguments but got {argc}."),
            );
        }

        if self.frames.len() >= self.max_frames {
            return self.throw(Exc::StackOverflow, "Stack overflow.".into());
        }

        let module = match self.heap.get(closure) {
            Obj::Closure(c) => c.module,
            _ => unreachable!(),
        };
        self.frames.push(CallFrame {
            closure,
            function,
            module,
            ip: 0,
            base: self.stack.len() - arity - 1,
            is_try: false,
            catch_ip: 0,
            try_stack: 0,
        });
        Ok(())
    }

    fn call_native(&mut self, native: ObjRef, argc: usize, receiver: Option<Value>) -> Result<()> {
        let (func, arity, varargs) = match self.heap.get(native) {
            Obj::Native(n) => (n.func, n.arity as usize, n.varargs),
            _ => unreachable!("callee is not a native"),
        };
        if (varargs && argc < arity) || (!varargs && argc != arity) {
            return self.throw(
                Exc::Arity,
                format!("Expected {arity} arguments but got {argc}."),
            );
        }
        // The arguments stay on the stack (rooting them) while the native
        // runs; it receives copies.
        let start = self.stack.len() - argc;
        let args = self.stack[start..].to_vec();
        match func(self, receiver, args) {
            Ok(result) => {
                let below_callee = self.stack.len() - argc - 1;
                self.stack.truncate(below_callee);
                self.push(result);
                Ok(())
            }
            Err(err) => self.handle_native_error(err),
        }
    }

    /// Instantiate a class: replace the callee slot with a fresh instance
    /// and run its constructor, if any.
    fn call_class(&mut self, class: ObjRef, argc: usize) -> Result<()> {
        let slot = self.stack.len() - argc - 1;
        let instance = self.alloc(Obj::Instance(ObjInstance {
            class,
            fields: Table::new(),
        }));
        self.stack[slot] = Value::Obj(instance);

        let constructor = {
            let key = self.names.constructor;
            let hash = self.heap.str_hash(key);
            match self.heap.get(class) {
                Obj::Class(c) => c.methods.get(key, hash),
                _ => unreachable!("callee is not a class"),
            }
        };
        match constructor {
            Some(Value::Obj(m)) => match self.heap.get(m) {
                Obj::Closure(_) => self.call_closure(m, argc),
                Obj::Native(n) => {
                    let (func, arity, varargs) = (n.func, n.arity as usize, n.varargs);
                    if (varargs && argc < arity) || (!varargs && argc != arity) {
                        return self.throw(
                            Exc::Arity,
                            format!("Expected {arity} arguments but got {argc}."),
                        );
                    }
                    let start = self.stack.len() - argc;
                    let args = self.stack[start..].to_vec();
                    match func(self, Some(Value::Obj(instance)), args) {
                        Ok(_) => {
                            // The instance below the arguments is the result.
                            self.stack.truncate(slot + 1);
                            Ok(())
                        }
                        Err(err) => self.handle_native_error(err),
                    }
                }
                _ => self.throw(Exc::Type, "Constructor must be callable.".into()),
            },
            Some(_) => self.throw(Exc::Type, "Constructor must be callable.".into()),
            None => {
                if argc != 0 {
                    self.throw(Exc::Arity, format!("Expected 0 arguments but got {argc}."))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Run a callable to completion from native context (the nested drive).
    ///
    /// Returns `Unwound` when an exception escaped past the entry depth and
    /// was caught by an outer frame; the caller must abandon its work and
    /// return the error up to the dispatch loop untouched.
    pub(crate) fn call_nested(&mut self, callee: Value, args: &[Value]) -> NativeResult {
        let baseline = self.frames.len();
        let serial = self.unwind_serial;
        self.push(callee);
        for &arg in args {
            self.push(arg);
        }
        if let Err(err) = self.call_value(args.len()) {
            return Err(NativeError::Fatal(err));
        }
        if self.frames.len() > baseline
            && let Err(err) = self.run_loop(baseline)
        {
            return Err(NativeError::Fatal(err));
        }
        // Execution stopped the moment a handler at or below our entry
        // depth took over; anything we pushed is gone and the top of stack
        // is the exception, not a result.
        if self.frames.len() < baseline
            || (self.unwind_serial != serial && self.unwind_depth <= baseline)
        {
            return Err(NativeError::Unwound);
        }
        Ok(self.pop())
    }

    /// Invoke `method` on `receiver` from native context.
    pub(crate) fn call_method_nested(&mut self, receiver: Value, method: Value) -> NativeResult {
        match method {
            Value::Obj(m) => match self.heap.get(m) {
                Obj::Closure(_) => {
                    let bound = self.alloc(Obj::BoundMethod(ObjBoundMethod {
                        receiver,
                        method: m,
                    }));
                    self.call_nested(Value::Obj(bound), &[])
                }
                Obj::Native(n) => {
                    let func = n.func;
                    func(self, Some(receiver), Vec::new())
                }
                _ => self.call_nested(method, &[]),
            },
            _ => self.call_nested(method, &[]),
        }
    }

    // -----------------------------------------------------------------------
    // Exceptions
    // -----------------------------------------------------------------------

    fn handle_native_error(&mut self, err: NativeError) -> Result<()> {
        match err {
            NativeError::Exception(value) => self.throw_value(value),
            NativeError::Unwound => Ok(()),
            NativeError::Fatal(err) => Err(err),
        }
    }

    /// Build an exception of the named built-in class and unwind with it.
    pub(crate) fn throw(&mut self, kind: Exc, message: String) -> Result<()> {
        let class = self.exception_class_for(kind);
        let exception = self.make_exception(class, &message);
        self.throw_value(exception)
    }

    /// A `NativeError` carrying a freshly built exception, for natives.
    pub(crate) fn native_exception(&mut self, kind: Exc, message: impl Into<String>) -> NativeError {
        let class = self.exception_class_for(kind);
        let exception = self.make_exception(class, &message.into());
        NativeError::Exception(exception)
    }

    /// The named exception class resolves through the current module's
    /// globals (so scripts can observe their own bindings), falling back to
    /// the built-in class when shadowed by a non-class.
    fn exception_class_for(&mut self, kind: Exc) -> ObjRef {
        let name = self.intern(kind.class_name());
        let hash = self.heap.str_hash(name);
        let module = self
            .frames
            .last()
            .map(|frame| frame.module)
            .unwrap_or(self.entry_module);
        if let Some(Value::Obj(r)) = self.modules[module.0].globals.get(name, hash)
            && matches!(self.heap.get(r), Obj::Class(_))
        {
            return r;
        }
        self.builtins.exception_for(kind)
    }

    pub(crate) fn make_exception(&mut self, class: ObjRef, message: &str) -> Value {
        let instance = self.alloc(Obj::Instance(ObjInstance {
            class,
            fields: Table::new(),
        }));
        self.temp_roots.push(Value::Obj(instance));
        let text = self.intern(message);
        let key = self.names.message;
        let hash = self.heap.str_hash(key);
        if let Obj::Instance(i) = self.heap.get_mut(instance) {
            i.fields.set(key, hash, Value::Obj(text));
        }
        self.temp_roots.pop();
        Value::Obj(instance)
    }

    fn is_exception_instance(&self, value: Value) -> bool {
        let Value::Obj(r) = value else { return false };
        let Obj::Instance(instance) = self.heap.get(r) else {
            return false;
        };
        let mut current = Some(instance.class);
        while let Some(c) = current {
            if c == self.builtins.exception_class {
                return true;
            }
            current = match self.heap.get(c) {
                Obj::Class(class) => class.superclass,
                _ => None,
            };
        }
        false
    }

    /// Unwind the frame stack with `exception`, collecting the stack trace
    /// along the way. Lands at the nearest armed `try` (with the exception
    /// on top of the stack and the frame's `is_try` cleared) or reports the
    /// uncaught exception.
    fn throw_value(&mut self, exception: Value) -> Result<()> {
        let mut entries: Vec<(String, u32)> = Vec::new();
        loop {
            let Some(frame) = self.frames.last() else {
                break;
            };
            if frame.is_try {
                let (catch_ip, floor) = (frame.catch_ip, frame.try_stack);
                let frame = self.frames.last_mut().expect("frame checked above");
                frame.is_try = false;
                frame.ip = catch_ip;
                self.close_upvalues(floor);
                self.stack.truncate(floor);
                self.push(exception);
                self.unwind_serial += 1;
                self.unwind_depth = self.frames.len();

                let rendered = render_trace(&entries);
                self.attach_trace(exception, &rendered);
                return Ok(());
            }
            entries.push(self.frame_trace_entry());
            let frame = self.frames.pop().expect("frame checked above");
            self.close_upvalues(frame.base);
            self.stack.truncate(frame.base);
        }

        // Uncaught: report and end execution.
        let rendered = render_trace(&entries);
        let message = format!("Uncaught {}", self.exception_summary(exception));
        eprintln!("{message}");
        for line in &rendered {
            eprintln!("    {line}");
        }
        Err(Error::Runtime {
            message,
            trace: rendered,
        })
    }

    fn frame_trace_entry(&self) -> (String, u32) {
        let frame = self.frame();
        let name = match self.heap.get(frame.function) {
            Obj::Function(f) => match f.name {
                Some(name) => format!("{}()", self.heap.str_value(name)),
                None if f.is_lambda => "<lambda>".to_string(),
                None => "script".to_string(),
            },
            _ => "script".to_string(),
        };
        (name, self.current_line())
    }

    /// Store the rendered trace as a list of strings in the exception's
    /// `stackTrace` field.
    fn attach_trace(&mut self, exception: Value, rendered: &[String]) {
        let Value::Obj(instance) = exception else { return };
        if !matches!(self.heap.get(instance), Obj::Instance(_)) {
            return;
        }
        let mark = self.temp_roots.len();
        for line in rendered {
            let text = self.intern(line);
            self.temp_roots.push(Value::Obj(text));
        }
        let items = self.temp_roots.split_off(mark);
        let list = self.alloc_list(items);
        self.temp_roots.push(list);
        let key = self.names.stack_trace;
        let hash = self.heap.str_hash(key);
        if let Obj::Instance(i) = self.heap.get_mut(instance) {
            i.fields.set(key, hash, list);
        }
        self.temp_roots.pop();
    }

    /// `ClassName: message` for error reporting.
    fn exception_summary(&mut self, exception: Value) -> String {
        let Value::Obj(r) = exception else {
            return "exception".to_string();
        };
        let Obj::Instance(instance) = self.heap.get(r) else {
            return "exception".to_string();
        };
        let class_name = match self.heap.get(instance.class) {
            Obj::Class(c) => self.heap.str_value(c.name).to_string(),
            _ => "Exception".to_string(),
        };
        let key = self.names.message;
        let hash = self.heap.str_hash(key);
        let message = match self.heap.get(r) {
            Obj::Instance(i) => i.fields.get(key, hash),
            _ => None,
        };
        match message {
            Some(Value::Obj(m)) if matches!(self.heap.get(m), Obj::Str(_)) => {
                format!("{class_name}: {}", self.heap.str_value(m))
            }
            _ => class_name,
        }
    }

    // -----------------------------------------------------------------------
    // Imports
    // -----------------------------------------------------------------------

    /// Resolve `import "path"`: cached import object, or load, compile and
    /// run `<directory>/<path>.dgn` and capture its exports.
    fn op_import(&mut self, path: ObjRef) -> Result<()> {
        let hash = self.heap.str_hash(path);
        if let Some(cached) = self.import_cache.get(path, hash) {
            self.push(cached);
            return Ok(());
        }

        let path_text = self.heap.str_value(path).to_string();
        let file = self.directory.join(format!("{path_text}.dgn"));
        let source = match self.loader.read_file(&file) {
            Ok(source) => source,
            Err(err) => {
                return Err(Error::File {
                    path: file.to_string_lossy().into_owned(),
                    source: err,
                });
            }
        };
        debug!(path = %path_text, "importing module");

        self.heap.gc_enabled = false;
        let function = match compile(&source, &mut self.heap) {
            Ok(function) => function,
            Err(err) => {
                self.heap.gc_enabled = true;
                return Err(err);
            }
        };
        let module = self.new_module(&path_text);
        let closure = self.heap.alloc(Obj::Closure(ObjClosure {
            function,
            upvalues: Vec::new(),
            module,
        }));
        self.heap.gc_enabled = true;

        // Run the module's top level from native mode. A propagating
        // exception leaves the importer resumed at its handler (or fatal).
        match self.call_nested(Value::Obj(closure), &[]) {
            Ok(_) => {}
            Err(NativeError::Unwound) => return Ok(()),
            Err(NativeError::Exception(value)) => return self.throw_value(value),
            Err(NativeError::Fatal(err)) => return Err(err),
        }

        let import_object = self.alloc(Obj::Instance(ObjInstance {
            class: self.builtins.import_class,
            fields: Table::new(),
        }));
        self.push(Value::Obj(import_object));
        let exports = self.modules[module.0].exports.clone();
        if let Obj::Instance(i) = self.heap.get_mut(import_object) {
            i.fields.add_all(&exports);
        }
        self.import_cache.set(path, hash, Value::Obj(import_object));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Stringification
    // -----------------------------------------------------------------------

    /// Render a value the way `print` shows it. For instances this invokes
    /// the `toString` protocol (field first, then method) and requires a
    /// string result.
    pub(crate) fn stringify(&mut self, value: Value) -> std::result::Result<String, NativeError> {
        match value {
            Value::Null => Ok("null".to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            Value::Number(n) => Ok(number_to_string(n)),
            Value::Obj(r) => match self.heap.get(r) {
                Obj::Str(s) => Ok(s.chars.to_string()),
                Obj::List(_) => {
                    let items = match self.heap.get(r) {
                        Obj::List(list) => list.items.clone(),
                        _ => unreachable!(),
                    };
                    let mut parts = Vec::with_capacity(items.len());
                    for item in items {
                        parts.push(self.repr(item)?);
                    }
                    Ok(format!("[{}]", parts.join(", ")))
                }
                Obj::Function(f) => Ok(function_label(&self.heap, f.name, f.is_lambda)),
                Obj::Closure(c) => {
                    let function = c.function;
                    match self.heap.get(function) {
                        Obj::Function(f) => Ok(function_label(&self.heap, f.name, f.is_lambda)),
                        _ => Ok("<function>".to_string()),
                    }
                }
                Obj::BoundMethod(b) => {
                    let method = b.method;
                    let function = match self.heap.get(method) {
                        Obj::Closure(c) => c.function,
                        _ => method,
                    };
                    match self.heap.get(function) {
                        Obj::Function(f) => Ok(function_label(&self.heap, f.name, f.is_lambda)),
                        _ => Ok("<function>".to_string()),
                    }
                }
                Obj::Native(n) => Ok(format!("<native {}>", self.heap.str_value(n.name))),
                Obj::Class(c) => Ok(format!("<class {}>", self.heap.str_value(c.name))),
                Obj::Instance(_) => self.instance_to_string(value, r),
                Obj::Upvalue(_) => Ok("<upvalue>".to_string()),
            },
        }
    }

    fn instance_to_string(
        &mut self,
        value: Value,
        instance: ObjRef,
    ) -> std::result::Result<String, NativeError> {
        let key = self.names.to_string;
        let hash = self.heap.str_hash(key);
        let (field, class) = match self.heap.get(instance) {
            Obj::Instance(i) => (i.fields.get(key, hash), i.class),
            _ => unreachable!("not an instance"),
        };
        let callee = field.or_else(|| match self.heap.get(class) {
            Obj::Class(c) => c.methods.get(key, hash),
            _ => None,
        });
        let Some(method) = callee else {
            return Err(self.native_exception(Exc::Type, "toString must return a string."));
        };
        let result = self.call_method_nested(value, method)?;
        match result {
            Value::Obj(s) if matches!(self.heap.get(s), Obj::Str(_)) => {
                Ok(self.heap.str_value(s).to_string())
            }
            _ => Err(self.native_exception(Exc::Type, "toString must return a string.")),
        }
    }

    /// Like [`Vm::stringify`] but quoting strings, used for list elements
    /// and the `repr` native. Idempotent over its own output for
    /// non-instance values.
    pub(crate) fn repr(&mut self, value: Value) -> std::result::Result<String, NativeError> {
        if let Value::Obj(r) = value
            && let Obj::Str(s) = self.heap.get(r)
        {
            let mut out = String::with_capacity(s.chars.len() + 2);
            out.push('"');
            for c in s.chars.chars() {
                match c {
                    '"' => out.push_str("\\\""),
                    '\\' => out.push_str("\\\\"),
                    '\n' => out.push_str("\\n"),
                    '\t' => out.push_str("\\t"),
                    '\r' => out.push_str("\\r"),
                    _ => out.push(c),
                }
            }
            out.push('"');
            return Ok(out);
        }
        self.stringify(value)
    }
}

fn function_label(heap: &Heap, name: Option<ObjRef>, is_lambda: bool) -> String {
    match name {
        Some(name) => format!("<function {}>", heap.str_value(name)),
        None if is_lambda => "<lambda>".to_string(),
        None => "<script>".to_string(),
    }
}

/// Render trace entries innermost-first, collapsing runs of the same
/// function/line pair.
fn render_trace(entries: &[(String, u32)]) -> Vec<String> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < entries.len() {
        let (name, line) = &entries[i];
        let mut run = 1;
        while i + run < entries.len() && entries[i + run] == entries[i] {
            run += 1;
        }
        out.push(format!("[line {line}] in {name}"));
        if run > 1 {
            out.push(format!("[Previous × {}]", run - 1));
        }
        i += run;
    }
    out
}
