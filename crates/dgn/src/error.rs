use thiserror::Error;

/// Errors surfaced to the embedder.
///
/// Recoverable failures inside running scripts are *not* represented here:
/// those are language-level exception instances handled by the VM's unwinder.
/// Only the three non-catchable outcomes cross the library boundary: a
/// script that failed to compile, an exception nobody caught, and a source
/// file that could not be read.
#[derive(Debug, Error)]
pub enum Error {
    /// One or more compile-time diagnostics. Each entry is already formatted
    /// as `[<line>] Error at <token>: <message>`.
    #[error("{}", .0.join("\n"))]
    Compile(Vec<String>),

    /// An exception propagated out of the outermost frame. `trace` holds the
    /// rendered stack trace, innermost call first.
    #[error("{message}")]
    Runtime { message: String, trace: Vec<String> },

    /// A script or imported module file could not be read.
    #[error("could not read \"{path}\": {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// The process exit status an external driver should map this error to.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Compile(_) => 121,
            Error::Runtime { .. } => 122,
            Error::File { .. } => 120,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
