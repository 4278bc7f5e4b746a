//! dgn: an embeddable, dynamically-typed scripting language.
//!
//! The crate implements the full compile-and-execute pipeline for `.dgn`
//! source: a restartable scanner, a single-pass Pratt compiler emitting
//! byte-stream chunks, a stack-based VM with call frames and exception
//! unwinding, a mark-and-sweep heap with interned strings, and a module
//! system behind `import`/`export`.
//!
//! # Quick start
//!
//! ```
//! use dgn::Interpreter;
//!
//! let mut interp = Interpreter::new(".");
//! interp.run(r#"
//!     var squares = [1, 2, 3].map(|x| x * x);
//!     print(squares);
//! "#).unwrap();
//! assert_eq!(interp.take_output(), vec!["[1, 4, 9]"]);
//! ```
//!
//! # Language highlights
//!
//! - Values: booleans, `null`, IEEE-754 numbers, interned strings, lists,
//!   functions/closures/lambdas, classes and instances
//! - Control flow: `if`/`while`/`for`/`foreach`, `switch` with pattern
//!   arms (usable as an expression), `try`/`catch`/`finally` and `throw`
//! - Classes with single inheritance (`class B : A`), `this`/`super`, and
//!   a base object class every instance derives from
//! - Modules: `import "path"` runs `<dir>/<path>.dgn` once and exposes its
//!   `export`ed names on an import object
//! - Errors are catchable exception instances (`TypeException`,
//!   `IndexException`, ...) carrying `message` and `stackTrace`
//!
//! # Embedding
//!
//! [`Interpreter`] is the entry point: it captures `print` output, reads
//! imports through a pluggable [`FileLoader`], and accepts host functions
//! via [`Interpreter::define_native`] using the same call protocol as
//! language closures.

mod builtins;
mod bytecode;
mod compiler;
mod error;
mod heap;
mod interpreter;
mod methods;
mod modules;
mod object;
mod scanner;
mod table;
mod value;
mod vm;

pub use error::{Error, Result};
pub use interpreter::{Interpreter, Limits};
pub use modules::{FileLoader, FsLoader, MemoryLoader};
pub use value::Value;
pub use vm::{NativeError, NativeFn, NativeResult, Vm};
