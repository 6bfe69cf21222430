//! File access tracking.
//!
//! Records which files a compiler reads so the cache can check them for
//! freshness later. One log per compile; logs are cheap to clone and share
//! across the compiler's callbacks.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;

/// Set of files accessed during one compilation, in first-access order.
#[derive(Debug, Clone, Default)]
pub struct AccessLog {
    inner: Arc<Mutex<AccessLogInner>>,
}

#[derive(Debug, Default)]
struct AccessLogInner {
    seen: FxHashSet<PathBuf>,
    order: Vec<PathBuf>,
}

impl AccessLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an access. Repeated accesses are kept once.
    pub fn record(&self, path: &Path) {
        let path = absolutize(path);
        let mut inner = self.inner.lock();
        if inner.seen.insert(path.clone()) {
            inner.order.push(path);
        }
    }

    /// All accessed files except `main`.
    pub fn dependencies_of(&self, main: &Path) -> Vec<PathBuf> {
        let main = absolutize(main);
        self.inner
            .lock()
            .order
            .iter()
            .filter(|p| **p != main)
            .cloned()
            .collect()
    }

    /// Number of distinct files recorded.
    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Make `path` absolute without touching the filesystem beyond `cwd`.
fn absolutize(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
