//! Heap object variants.
//!
//! Every reference value on the stack points at one of these through an
//! [`ObjRef`](crate::value::ObjRef) handle. The variants carry no GC state
//! themselves; the mark bit and size accounting live on the arena slot in
//! [`crate::heap::Heap`].

use crate::bytecode::Chunk;
use crate::modules::ModuleId;
use crate::table::Table;
use crate::value::{ObjRef, Value};
use crate::vm::NativeFn;

/// A heap-allocated object.
#[derive(Debug)]
pub enum Obj {
    Str(ObjStr),
    List(ObjList),
    Function(ObjFunction),
    Closure(ObjClosure),
    Upvalue(Upvalue),
    Class(ObjClass),
    Instance(ObjInstance),
    BoundMethod(ObjBoundMethod),
    Native(ObjNative),
}

/// An immutable, interned string with its FNV-1a hash cached at creation.
#[derive(Debug)]
pub struct ObjStr {
    pub chars: Box<str>,
    pub hash: u32,
}

/// A growable ordered sequence of values.
#[derive(Debug)]
pub struct ObjList {
    pub items: Vec<Value>,
}

/// A compiled function body. Closures wrap these at runtime; the bare
/// function only ever appears inside constant pools.
#[derive(Debug)]
pub struct ObjFunction {
    pub arity: u8,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    /// `None` for the top-level script and for lambdas.
    pub name: Option<ObjRef>,
    /// Lambdas have lax arity: missing arguments become `null`, extras are
    /// dropped.
    pub is_lambda: bool,
    /// When set, the last parameter collects all surplus arguments as a list.
    pub varargs: bool,
}

/// A function bound to its captured upvalues and its owning module.
#[derive(Debug)]
pub struct ObjClosure {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
    pub module: ModuleId,
}

/// A captured variable: either still living on the value stack, or moved
/// into the upvalue itself once its scope ended.
#[derive(Debug, Clone, Copy)]
pub enum Upvalue {
    Open(usize),
    Closed(Value),
}

#[derive(Debug)]
pub struct ObjClass {
    pub name: ObjRef,
    pub methods: Table,
    pub superclass: Option<ObjRef>,
}

#[derive(Debug)]
pub struct ObjInstance {
    pub class: ObjRef,
    pub fields: Table,
}

/// A method closure pinned to the receiver it was looked up on.
#[derive(Debug)]
pub struct ObjBoundMethod {
    pub receiver: Value,
    pub method: ObjRef,
}

/// A built-in callable. When a native is bound as a method, `receiver`
/// carries the value it was looked up on.
#[derive(Debug)]
pub struct ObjNative {
    pub name: ObjRef,
    pub func: NativeFn,
    pub arity: u8,
    pub varargs: bool,
    pub receiver: Option<Value>,
}

impl Obj {
    /// The `typeof` name for values of this object kind.
    pub fn type_name(&self) -> &'static str {
        match self {
            Obj::Str(_) => "string",
            Obj::List(_) => "list",
            Obj::Function(_) | Obj::Closure(_) | Obj::BoundMethod(_) | Obj::Native(_) => "function",
            Obj::Class(_) => "class",
            Obj::Instance(_) => "instance",
            // Upvalues never escape onto the user-visible stack.
            Obj::Upvalue(_) => "upvalue",
        }
    }
}

/// FNV-1a over the string's bytes; cached on every [`ObjStr`].
pub fn hash_str(s: &str) -> u32 {
    let mut hash: u32 = 2_166_136_261;
    for byte in s.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16_777_619);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_known_vectors() {
        assert_eq!(hash_str(""), 2_166_136_261);
        assert_eq!(hash_str("a"), 0xe40c292c);
        assert_eq!(hash_str("foobar"), 0xbf9cf968);
    }
}
