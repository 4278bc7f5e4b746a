//! Modules and the file surface behind `import`.
//!
//! Each compiled source unit is a [`Module`] owning two tables: `globals`
//! (every top-level binding of the module) and `exports` (the subset made
//! visible to importers via `export`). The VM keeps all modules alive for
//! the life of the process and caches one import object per path, so a
//! module's top level runs at most once.

use std::io;
use std::path::Path;

use crate::table::Table;

/// Index of a module in the VM's module list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleId(pub(crate) usize);

/// One compiled source unit and its bindings.
#[derive(Debug)]
pub struct Module {
    /// The import path, or `$main$` for the entry module.
    pub path: String,
    pub globals: Table,
    pub exports: Table,
}

impl Module {
    pub fn new(path: impl Into<String>) -> Self {
        Module {
            path: path.into(),
            globals: Table::new(),
            exports: Table::new(),
        }
    }
}

/// How the VM reads module source files.
///
/// `import "p"` resolves to `<directory>/<p>.dgn` and hands the joined path
/// to this trait, so embedders (and tests) can serve sources from anywhere.
pub trait FileLoader {
    fn read_file(&self, path: &Path) -> io::Result<String>;
}

/// The default loader: plain filesystem reads.
#[derive(Debug, Default)]
pub struct FsLoader;

impl FileLoader for FsLoader {
    fn read_file(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }
}

/// An in-memory loader, used by tests and embedders that ship sources with
/// the host program.
#[derive(Debug, Default)]
pub struct MemoryLoader {
    files: std::collections::HashMap<String, String>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        MemoryLoader::default()
    }

    /// Register `source` under `path` (the full joined path, extension
    /// included).
    pub fn add(&mut self, path: impl Into<String>, source: impl Into<String>) -> &mut Self {
        self.files.insert(path.into(), source.into());
        self
    }
}

impl FileLoader for MemoryLoader {
    fn read_file(&self, path: &Path) -> io::Result<String> {
        self.files
            .get(&path.to_string_lossy().into_owned())
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such file"))
    }
}
