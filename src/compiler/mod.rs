//! Transpiler interface and built-in compilers.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    Compiler Registry                         │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  CompilerRegistry (priority order)                           │
//! │    ├─► ScssCompiler      .scss → .css   (feature `scss`)     │
//! │    ├─► ScssCompiler      .sass → .css   (feature `scss`)     │
//! │    └─► CommandCompiler   .ext  → .out   (user supplied)      │
//! │                                                              │
//! │  ExtensionMaps::build(&registry)                             │
//! │    ├─► target_of:  .scss → .css                              │
//! │    └─► sources_of: .css  → [.scss, .sass]                    │
//! │                                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! A [`Compiler`] turns one real source file into a [`Compiled`] value: the
//! output text plus every other file it read. Failures come back as a
//! [`CompileFailure`] carrying the location needed by [`crate::render`].

mod access;
mod command;
mod registry;
#[cfg(feature = "scss")]
mod scss;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use access::AccessLog;
pub use command::{BROWSERS_ENV, CommandCompiler, CommandSpecError, SOURCE_MAP_ENV};
pub use registry::{CompilerRegistry, ExtensionMaps};
#[cfg(feature = "scss")]
pub use scss::ScssCompiler;

use crate::config::MountOptions;

// =============================================================================
// Compile Options
// =============================================================================

/// Options forwarded to every compile and post-process call.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Emit source-map annotations when the compiler supports them.
    pub source_map: bool,
    /// Browser targets for CSS post-processing.
    pub browsers: Vec<String>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self::from(&MountOptions::default())
    }
}

impl From<&MountOptions> for CompileOptions {
    fn from(options: &MountOptions) -> Self {
        Self {
            source_map: options.source_map,
            browsers: options.browsers.clone(),
        }
    }
}

// =============================================================================
// Compile Results
// =============================================================================

/// Successful compiler output.
#[derive(Debug, Clone, Default)]
pub struct Compiled {
    /// Output text.
    pub output: String,
    /// Other files read during compilation (partials, imports).
    pub imports: Vec<PathBuf>,
}

impl Compiled {
    /// Output with no imports.
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            imports: Vec::new(),
        }
    }

    /// Attach imported file paths.
    pub fn with_imports(mut self, imports: Vec<PathBuf>) -> Self {
        self.imports = imports;
        self
    }
}

/// A transpiler failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileFailure {
    /// Compiler message.
    pub message: String,
    /// File the failure points at (may be a partial rather than the main file).
    pub file: PathBuf,
    /// 1-based line, when the compiler reports one.
    pub line: Option<usize>,
    /// 1-based column, when the compiler reports one.
    pub column: Option<usize>,
    /// Files read before the failure; a change to any of them retries the compile.
    pub imports: Vec<PathBuf>,
}

impl CompileFailure {
    /// Failure without location information.
    pub fn new(file: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            file: file.into(),
            line: None,
            column: None,
            imports: Vec::new(),
        }
    }

    /// Attach a line/column location.
    pub fn at(mut self, line: usize, column: Option<usize>) -> Self {
        self.line = Some(line);
        self.column = column;
        self
    }

    /// Attach the files read before failing.
    pub fn with_imports(mut self, imports: Vec<PathBuf>) -> Self {
        self.imports = imports;
        self
    }
}

impl fmt::Display for CompileFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.file.display())?;
        if let Some(line) = self.line {
            write!(f, ":{line}")?;
            if let Some(column) = self.column {
                write!(f, ":{column}")?;
            }
        }
        write!(f, ": {}", self.message)
    }
}

impl std::error::Error for CompileFailure {}

// =============================================================================
// Compiler Trait
// =============================================================================

/// A transpiler for one source extension.
///
/// Extensions include the leading dot (`".scss"`). Implementations must be
/// thread-safe: compiles run on a worker pool and may overlap for different
/// paths.
pub trait Compiler: Send + Sync {
    /// Source extension handled, e.g. `".scss"`.
    fn source_ext(&self) -> &str;

    /// Extension of the produced output, e.g. `".css"`.
    fn output_ext(&self) -> &str;

    /// Compile the file at `path`.
    fn compile(&self, path: &Path, options: &CompileOptions) -> Result<Compiled, CompileFailure>;
}

impl fmt::Debug for dyn Compiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Compiler({} -> {})", self.source_ext(), self.output_ext())
    }
}

/// Post-processing filter applied to output of a given target extension
/// (e.g. vendor prefixing of CSS).
pub trait PostProcessor: Send + Sync {
    /// Target extension this filter applies to, e.g. `".css"`.
    fn target_ext(&self) -> &str;

    /// Transform compiled output.
    fn process(&self, output: String, options: &CompileOptions) -> Result<String, String>;
}

/// Compiler for real files that already carry a target extension.
///
/// Serves the bytes unchanged so post-processors still apply to them.
#[derive(Debug, Clone)]
pub struct Verbatim {
    ext: String,
}

impl Verbatim {
    /// Verbatim compiler for `ext` (leading dot included).
    pub fn new(ext: impl Into<String>) -> Self {
        Self { ext: ext.into() }
    }
}

impl Compiler for Verbatim {
    fn source_ext(&self) -> &str {
        &self.ext
    }

    fn output_ext(&self) -> &str {
        &self.ext
    }

    fn compile(&self, path: &Path, _options: &CompileOptions) -> Result<Compiled, CompileFailure> {
        let bytes = std::fs::read(path).map_err(|e| CompileFailure::new(path, e.to_string()))?;
        Ok(Compiled::new(String::from_utf8_lossy(&bytes).into_owned()))
    }
}

/// Shared compiler handle.
pub type SharedCompiler = Arc<dyn Compiler>;

/// Extension of a path including the leading dot, if any.
///
/// Dotfiles without a further extension (`.bashrc`) have none.
pub fn extension_of(path: impl AsRef<Path>) -> Option<String> {
    path.as_ref()
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
}

/// Normalize an extension to carry a leading dot.
pub fn normalize_ext(ext: &str) -> String {
    if ext.starts_with('.') {
        ext.to_string()
    } else {
        format!(".{ext}")
    }
}
