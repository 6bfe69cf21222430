//! # transpile-fs
//!
//! A read-only userspace filesystem that serves a transpiled view of a
//! source tree. Files whose extension a registered compiler understands
//! appear under the compiler's output extension (`style.scss` shows up as
//! `style.css`) and are compiled on first read; everything else passes
//! through untouched.
//!
//! - **Compile on demand**: at most one compile per path is in flight;
//!   concurrent readers share its result
//! - **Dependency-aware caching**: an entry stays fresh until the source or
//!   any file it imported changes
//! - **Errors as content**: a failed compile serves a stylesheet, script or
//!   page that shows the error instead of failing the read
//! - **Live invalidation**: optional change notification for glob patterns
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use transpile_fs::prelude::*;
//!
//! let options = OptionsBuilder::new().watch("**/*.scss").build();
//! let fs = TranspileFs::new("site", &CompilerRegistry::builtin(), options)?;
//!
//! // Handlers can be driven directly...
//! let stat = fs.getattr("/style.css")?;
//! println!("compiled size: {}", stat.size);
//!
//! // ...or mounted through FUSE.
//! # #[cfg(feature = "fuse")]
//! let session = transpile_fs::fuse::spawn_mount(Arc::new(fs), "mnt".as_ref(), 4)?;
//! # Ok::<(), transpile_fs::FsError>(())
//! ```
//!
//! ## Modules
//!
//! - [`compiler`]: the [`Compiler`] trait, built-in compilers, registry
//! - [`translate`]: virtual ↔ real path mapping
//! - [`cache`]: compiled-output cache and freshness checks
//! - [`watch`]: change notification
//! - [`render`]: error content and terminal formatting
//! - [`mod@fs`]: request handlers
//! - `fuse`: kernel transport (feature `fuse`)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod compiler;
pub mod config;
pub mod error;
pub mod event;
pub mod fs;
#[cfg(feature = "fuse")]
pub mod fuse;
pub mod render;
pub mod translate;
pub mod watch;

// =============================================================================
// Prelude - import commonly used items with a single `use`
// =============================================================================

/// Prelude module for convenient imports.
///
/// ```
/// use transpile_fs::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        CompileFailure, CompileOptions, Compiled, Compiler, CompilerRegistry, FsError, FsEvent,
        MountOptions, OptionsBuilder, TranspileFs,
    };
}

// =============================================================================
// Re-exports
// =============================================================================

pub use cache::{Artifact, CompileCache};
pub use compiler::{
    CommandCompiler, CompileFailure, CompileOptions, Compiled, Compiler, CompilerRegistry,
    ExtensionMaps, PostProcessor,
};
#[cfg(feature = "scss")]
pub use compiler::ScssCompiler;
pub use config::{MountOptions, OptionsBuilder};
pub use error::{FsError, WatchError};
pub use event::{EventBus, FsEvent};
pub use fs::{DirEntry, FileKind, FileStat, StatFs, TranspileFs};
pub use render::{TerminalStyle, format_for_terminal, render_failure};
pub use translate::PathTranslator;
pub use watch::{ChangeBridge, WatchSet};
