//! The embedding façade.
//!
//! [`Interpreter`] owns one VM. Scripts run in its entry module, so
//! globals persist between [`Interpreter::run`] calls and feeding it one
//! line at a time gives REPL behavior. `print` output is captured and
//! handed out through [`Interpreter::take_output`].

use std::path::PathBuf;

use crate::error::Result;
use crate::modules::{FileLoader, FsLoader};
use crate::vm::{NativeFn, Vm, DEFAULT_MAX_FRAMES};

/// Resource limits for one interpreter.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Hard cap on call-stack depth; exceeding it raises a catchable
    /// `StackOverflowException` in the running script.
    pub max_frames: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_frames: DEFAULT_MAX_FRAMES,
        }
    }
}

/// An embedded interpreter for one script environment.
///
/// # Example
///
/// ```
/// use dgn::Interpreter;
///
/// let mut interp = Interpreter::new(".");
/// interp.run("print(1..3);").unwrap();
/// assert_eq!(interp.take_output(), vec!["[1, 2, 3]"]);
/// ```
pub struct Interpreter {
    vm: Vm,
}

impl Interpreter {
    /// Create an interpreter resolving imports under `directory`.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Interpreter::with_loader(directory, Box::new(FsLoader))
    }

    /// Create an interpreter with a custom import file loader.
    pub fn with_loader(directory: impl Into<PathBuf>, loader: Box<dyn FileLoader>) -> Self {
        Interpreter {
            vm: Vm::new(directory.into(), loader, Limits::default().max_frames),
        }
    }

    /// Replace the default limits. Call before running scripts.
    pub fn with_limits(directory: impl Into<PathBuf>, loader: Box<dyn FileLoader>, limits: Limits) -> Self {
        Interpreter {
            vm: Vm::new(directory.into(), loader, limits.max_frames),
        }
    }

    /// Compile and execute one script in the entry module.
    ///
    /// Returns the error for an uncompilable script, an uncaught exception,
    /// or an unreadable import; map it to a process status with
    /// [`crate::Error::exit_code`].
    pub fn run(&mut self, source: &str) -> Result<()> {
        self.vm.interpret(source)
    }

    /// Take every `print` line captured since the last call.
    pub fn take_output(&mut self) -> Vec<String> {
        self.vm.take_output()
    }

    /// Register a host function as a global of the entry module.
    ///
    /// `varargs` natives accept at least `arity` arguments; others exactly
    /// `arity`.
    pub fn define_native(&mut self, name: &str, arity: u8, varargs: bool, func: NativeFn) {
        self.vm.define_native(name, arity, varargs, func);
    }
}
