//! Cache freshness checks.
//!
//! An entry is fresh when neither its primary source nor any recorded
//! dependency was modified after the compile started. Equal timestamps count
//! as fresh; a missing dependency counts as stale.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Modification time of `path`, or `None` if it cannot be read.
pub fn mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Whether `path` is unchanged since `compile_time`.
pub fn unchanged_since(path: &Path, compile_time: SystemTime) -> bool {
    mtime(path).is_some_and(|m| m <= compile_time)
}

/// Whether a compile started at `compile_time` is still valid for `real`
/// and its `imports`.
pub fn is_fresh(compile_time: SystemTime, real: &Path, imports: &[PathBuf]) -> bool {
    if !unchanged_since(real, compile_time) {
        tracing::trace!(path = %real.display(), "source newer than cache entry");
        return false;
    }
    match imports.iter().find(|dep| !unchanged_since(dep, compile_time)) {
        Some(dep) => {
            tracing::trace!(
                path = %real.display(),
                dependency = %dep.display(),
                "dependency newer than cache entry"
            );
            false
        }
        None => true,
    }
}
