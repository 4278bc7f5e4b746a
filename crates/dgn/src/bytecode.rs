//! Bytecode instruction set and compiled chunk representation.
//!
//! The compiler produces one [`Chunk`] per function body: a flat byte
//! stream, a constant pool, and a run-length-encoded line table. Operand
//! encodings are fixed per opcode: jump offsets are 2 bytes big-endian,
//! constant-pool indices are ULEB-128, and stack slots / argument counts
//! are single bytes.

use num_enum::TryFromPrimitive;

use crate::value::Value;

/// One bytecode instruction.
///
/// The comment on each variant gives the operand layout and the stack
/// effect the VM implements for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum OpCode {
    /// `CONSTANT <uleb idx>`: push `constants[idx]`.
    Constant,
    /// Push `null`.
    Null,
    /// Push `true`.
    True,
    /// Push `false`.
    False,
    /// Push the built-in base object class (used by object literals).
    Object,
    /// `LIST <u8 n>`: pop n values, push a new list of them in push order.
    List,
    /// Pop `hi` then `lo`, push the inclusive integer range list `lo..hi`
    /// (descending when `lo > hi`).
    Range,
    /// Discard the top of stack.
    Pop,
    /// Duplicate the top of stack.
    Dup,
    /// Duplicate the top two stack values: `a b` becomes `a b a b`.
    DupTwo,
    /// Swap the top two stack values.
    Swap,

    /// `GET_GLOBAL <uleb name>`: push the named global of the current module.
    GetGlobal,
    /// `DEFINE_GLOBAL <uleb name>`: pop a value, define it as a module global.
    DefineGlobal,
    /// `SET_GLOBAL <uleb name>`: write top of stack to an existing global.
    SetGlobal,
    /// `GET_LOCAL <u8 slot>`: push the frame-relative slot.
    GetLocal,
    /// `SET_LOCAL <u8 slot>`: write top of stack to the frame-relative slot.
    SetLocal,
    /// `GET_UPVALUE <u8 idx>`: push through the closure's upvalue.
    GetUpvalue,
    /// `SET_UPVALUE <u8 idx>`: write top of stack through the upvalue.
    SetUpvalue,
    /// Close any open upvalue at the current stack top, then pop the slot.
    CloseUpvalue,

    /// `GET_PROPERTY <uleb name>`: pop receiver, push field or bound method.
    GetProperty,
    /// `SET_PROPERTY <uleb name>`: pop value and receiver, set the field,
    /// push the value back.
    SetProperty,
    /// `SET_PROPERTY_KV <uleb name>`: pop a value, set it as a field of the
    /// receiver below, leaving the receiver (object-literal building).
    SetPropertyKv,
    /// Pop index and receiver, push `receiver[index]`.
    GetIndex,
    /// Pop value, index and receiver, store, push the value back.
    SetIndex,
    /// `GET_SUPER <uleb name>`: pop the superclass, bind its method to the
    /// receiver below.
    GetSuper,

    /// Arithmetic negation.
    Negate,
    /// Logical not (truthiness).
    Not,
    /// Bitwise complement (whole numbers only).
    BitNot,
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    BitAnd,
    BitOr,
    BitXor,
    /// `<<` (whole numbers only).
    Shl,
    /// `>>` arithmetic shift (whole numbers only).
    Shr,
    /// `>>>` logical shift, operands treated as unsigned.
    Ushr,
    Equal,
    NotEqual,
    /// Identity for heap objects, `==` for everything else.
    Is,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    /// Membership: list element, substring, or instance field.
    In,
    /// Walk the superclass chain of the right operand's class.
    Instanceof,
    /// Pop a value, push its interned type name string.
    Typeof,

    /// `JUMP <u16 be>`: unconditional forward jump.
    Jump,
    /// `LOOP <u16 be>`: unconditional backward jump.
    Loop,
    /// `JUMP_IF_FALSE <u16 be>`: pop; jump when falsey.
    JumpIfFalse,
    /// `JUMP_IF_FALSE_SC <u16 be>`: peek; jump when falsey, keeping the
    /// value for short-circuit results.
    JumpIfFalseSc,

    /// `CALL <u8 argc>`: call the value below argc arguments.
    Call,
    /// `CLOSURE <uleb fn> (<u8 is_local> <u8 index>)*`: wrap a function
    /// constant in a closure, capturing each listed upvalue.
    Closure,
    /// `CLASS <uleb name>`: push a new class deriving the base object class.
    Class,
    /// Pop a superclass, copy its methods into the class below and link it.
    Inherit,
    /// `METHOD <uleb name>`: pop a closure, add it to the class below.
    Method,
    /// `INVOKE <uleb name> <u8 argc>`: method call on the receiver below
    /// the arguments, skipping the intermediate bound-method allocation.
    Invoke,
    /// `SUPER_INVOKE <uleb name> <u8 argc>`: pop the superclass, dispatch
    /// the method from it with the current receiver.
    SuperInvoke,
    /// Pop the return value, tear down the frame, push the value back.
    Return,

    /// Pop a value and raise it as an exception.
    Throw,
    /// `TRY_BEGIN <u16 be>`: arm the current frame; the operand is the
    /// forward offset to the catch target.
    TryBegin,
    /// Disarm the current frame's catch handler.
    TryEnd,

    /// `IMPORT <uleb path>`: push the (possibly cached) module's import
    /// object, loading and running the module on first use.
    Import,
    /// `EXPORT <uleb name>`: pop a value and bind it into the current
    /// module's exports.
    Export,
}

// ---------------------------------------------------------------------------
// ULEB-128
// ---------------------------------------------------------------------------

/// Append `value` to `buf` in unsigned LEB-128.
pub fn write_uleb128(buf: &mut Vec<u8>, mut value: u32) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            return;
        }
    }
}

/// Decode a ULEB-128 value starting at `*offset`, advancing it past the
/// encoding.
pub fn read_uleb128(code: &[u8], offset: &mut usize) -> u32 {
    let mut result = 0u32;
    let mut shift = 0;
    loop {
        let byte = code[*offset];
        *offset += 1;
        result |= ((byte & 0x7f) as u32) << shift;
        if byte & 0x80 == 0 {
            return result;
        }
        shift += 7;
    }
}

// ---------------------------------------------------------------------------
// Chunk
// ---------------------------------------------------------------------------

/// A run of consecutive instruction bytes attributed to one source line.
#[derive(Debug, Clone, Copy)]
struct LineRun {
    line: u32,
    count: u32,
}

/// Compiled bytecode for one function body: the instruction bytes, the
/// constant pool, and the line table.
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    pub code: Vec<u8>,
    pub constants: Vec<Value>,
    lines: Vec<LineRun>,
}

impl Chunk {
    pub fn new() -> Self {
        Chunk::default()
    }

    /// Append one instruction byte attributed to `line`.
    pub fn write(&mut self, byte: u8, line: u32) {
        self.code.push(byte);
        match self.lines.last_mut() {
            Some(run) if run.line == line => run.count += 1,
            _ => self.lines.push(LineRun { line, count: 1 }),
        }
    }

    pub fn write_op(&mut self, op: OpCode, line: u32) {
        self.write(op as u8, line);
    }

    /// Append a ULEB-128 operand attributed to `line`.
    pub fn write_uleb(&mut self, value: u32, line: u32) {
        let mut buf = Vec::with_capacity(5);
        write_uleb128(&mut buf, value);
        for byte in buf {
            self.write(byte, line);
        }
    }

    /// Add a constant and return its pool index. Identical constants share
    /// one slot.
    pub fn add_constant(&mut self, value: Value) -> u32 {
        for (i, existing) in self.constants.iter().enumerate() {
            if *existing == value {
                return i as u32;
            }
        }
        self.constants.push(value);
        (self.constants.len() - 1) as u32
    }

    /// The source line for the instruction byte at `offset`.
    pub fn line_at(&self, offset: usize) -> u32 {
        let mut remaining = offset;
        for run in &self.lines {
            if remaining < run.count as usize {
                return run.line;
            }
            remaining -= run.count as usize;
        }
        self.lines.last().map(|run| run.line).unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Disassembly
// ---------------------------------------------------------------------------

/// Render a chunk's instructions for debugging and tests.
///
/// Each line shows the byte offset, the source line (or `|` when unchanged),
/// the opcode name, and its decoded operands.
pub fn disassemble(chunk: &Chunk, heap: &crate::heap::Heap, name: &str) -> String {
    use std::fmt::Write;

    let mut out = format!("== {name} ==\n");
    let mut offset = 0;
    let mut last_line = 0;
    while offset < chunk.code.len() {
        let start = offset;
        let op = match OpCode::try_from(chunk.code[offset]) {
            Ok(op) => op,
            Err(_) => {
                let _ = writeln!(out, "{start:04} <bad opcode {}>", chunk.code[offset]);
                offset += 1;
                continue;
            }
        };
        offset += 1;

        let line = chunk.line_at(start);
        if line == last_line {
            let _ = write!(out, "{start:04}    | ");
        } else {
            let _ = write!(out, "{start:04} {line:4} ");
            last_line = line;
        }

        match op {
            OpCode::Constant
            | OpCode::GetGlobal
            | OpCode::DefineGlobal
            | OpCode::SetGlobal
            | OpCode::GetProperty
            | OpCode::SetProperty
            | OpCode::SetPropertyKv
            | OpCode::GetSuper
            | OpCode::Class
            | OpCode::Method
            | OpCode::Import
            | OpCode::Export => {
                let index = read_uleb128(&chunk.code, &mut offset);
                let constant = constant_label(chunk, heap, index);
                let _ = writeln!(out, "{op:?} {index} ({constant})");
            }
            OpCode::List | OpCode::Call | OpCode::GetLocal | OpCode::SetLocal
            | OpCode::GetUpvalue | OpCode::SetUpvalue => {
                let operand = chunk.code[offset];
                offset += 1;
                let _ = writeln!(out, "{op:?} {operand}");
            }
            OpCode::Jump | OpCode::JumpIfFalse | OpCode::JumpIfFalseSc | OpCode::TryBegin => {
                let distance = ((chunk.code[offset] as usize) << 8) | chunk.code[offset + 1] as usize;
                offset += 2;
                let _ = writeln!(out, "{op:?} -> {}", offset + distance);
            }
            OpCode::Loop => {
                let distance = ((chunk.code[offset] as usize) << 8) | chunk.code[offset + 1] as usize;
                offset += 2;
                let _ = writeln!(out, "{op:?} -> {}", offset - distance);
            }
            OpCode::Invoke | OpCode::SuperInvoke => {
                let index = read_uleb128(&chunk.code, &mut offset);
                let argc = chunk.code[offset];
                offset += 1;
                let constant = constant_label(chunk, heap, index);
                let _ = writeln!(out, "{op:?} {index} ({constant}) argc {argc}");
            }
            OpCode::Closure => {
                let index = read_uleb128(&chunk.code, &mut offset);
                let constant = constant_label(chunk, heap, index);
                let _ = writeln!(out, "{op:?} {index} ({constant})");
                if let Some(Value::Obj(f)) = chunk.constants.get(index as usize).copied()
                    && let crate::object::Obj::Function(function) = heap.get(f)
                {
                    for _ in 0..function.upvalue_count {
                        let is_local = chunk.code[offset];
                        let slot = chunk.code[offset + 1];
                        offset += 2;
                        let kind = if is_local == 1 { "local" } else { "upvalue" };
                        let _ = writeln!(out, "        |  {kind} {slot}");
                    }
                }
            }
            _ => {
                let _ = writeln!(out, "{op:?}");
            }
        }
    }
    out
}

fn constant_label(chunk: &Chunk, heap: &crate::heap::Heap, index: u32) -> String {
    match chunk.constants.get(index as usize) {
        Some(Value::Obj(r)) => match heap.get(*r) {
            crate::object::Obj::Str(s) => format!("\"{}\"", s.chars),
            crate::object::Obj::Function(f) => match f.name {
                Some(name) => format!("<function {}>", heap.str_value(name)),
                None => "<function>".to_string(),
            },
            other => format!("<{}>", other.type_name()),
        },
        Some(Value::Number(n)) => crate::value::number_to_string(*n),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Null) => "null".to_string(),
        None => "?".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    #[test]
    fn uleb_round_trip() {
        for value in [0u32, 1, 127, 128, 255, 300, 16_383, 16_384, u32::MAX] {
            let mut buf = Vec::new();
            write_uleb128(&mut buf, value);
            let mut offset = 0;
            assert_eq!(read_uleb128(&buf, &mut offset), value);
            assert_eq!(offset, buf.len());
        }
    }

    #[test]
    fn uleb_single_byte_below_128() {
        let mut buf = Vec::new();
        write_uleb128(&mut buf, 127);
        assert_eq!(buf, vec![0x7f]);
        buf.clear();
        write_uleb128(&mut buf, 128);
        assert_eq!(buf, vec![0x80, 0x01]);
    }

    #[test]
    fn line_table_run_length() {
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::Null, 1);
        chunk.write_op(OpCode::Null, 1);
        chunk.write_op(OpCode::Pop, 2);
        chunk.write_op(OpCode::Null, 2);
        chunk.write_op(OpCode::Return, 7);
        assert_eq!(chunk.line_at(0), 1);
        assert_eq!(chunk.line_at(1), 1);
        assert_eq!(chunk.line_at(2), 2);
        assert_eq!(chunk.line_at(3), 2);
        assert_eq!(chunk.line_at(4), 7);
        // Three runs backing five offsets.
        assert_eq!(chunk.lines.len(), 3);
    }

    #[test]
    fn constants_deduplicate() {
        let mut chunk = Chunk::new();
        let a = chunk.add_constant(Value::Number(1.0));
        let b = chunk.add_constant(Value::Number(2.0));
        let c = chunk.add_constant(Value::Number(1.0));
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(chunk.constants.len(), 2);
    }

    #[test]
    fn disassembles_operands() {
        let mut heap = Heap::new();
        let name = heap.intern("answer");
        let mut chunk = Chunk::new();
        let constant = chunk.add_constant(Value::Number(42.0));
        chunk.write_op(OpCode::Constant, 1);
        chunk.write_uleb(constant, 1);
        let global = chunk.add_constant(Value::Obj(name));
        chunk.write_op(OpCode::DefineGlobal, 1);
        chunk.write_uleb(global, 1);
        chunk.write_op(OpCode::Null, 2);
        chunk.write_op(OpCode::Return, 2);

        let listing = disassemble(&chunk, &heap, "test");
        assert!(listing.contains("Constant 0 (42)"), "{listing}");
        assert!(listing.contains("DefineGlobal 1 (\"answer\")"), "{listing}");
        assert!(listing.contains("Return"), "{listing}");
    }

    #[test]
    fn opcode_byte_round_trip() {
        for byte in 0..=OpCode::Export as u8 {
            let op = OpCode::try_from(byte).expect("every byte below the last opcode decodes");
            assert_eq!(op as u8, byte);
        }
        assert!(OpCode::try_from(OpCode::Export as u8 + 1).is_err());
    }
}
