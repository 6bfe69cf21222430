//! Per-path compiled-output cache.
//!
//! # Caching Strategy
//!
//! ```text
//! CompileCache (one per mount)
//! └── FxHashMap<virtual path, CacheEntry>
//!     └── CacheEntry
//!         ├── compile_time    recorded before the compiler runs
//!         ├── real            source path the entry was compiled from
//!         └── artifact        Arc<PendingArtifact>, shared by every opener
//!                             └── Artifact { content, imports, failure }
//! ```
//!
//! At most one compile is in flight per key: an opener either reuses the
//! current entry (in flight, or settled and fresh) or replaces it under the
//! map lock, so concurrent openers converge on the same pending artifact.
//! Compiles run on a dedicated rayon pool; readers block on the artifact.

mod freshness;
mod pending;

use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

pub use freshness::{is_fresh, mtime, unchanged_since};
pub use pending::{Artifact, PendingArtifact};

use crate::compiler::{
    CompileFailure, CompileOptions, Compiled, ExtensionMaps, SharedCompiler, extension_of,
};
use crate::error::FsError;
use crate::event::{EventBus, FsEvent};
use crate::render::render_failure;

// =============================================================================
// Cache Entry
// =============================================================================

/// Why an artifact is being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// A file handle is being opened.
    Open,
    /// An attribute query needs the output size.
    Stat,
}

/// One cached compile.
#[derive(Clone)]
pub struct CacheEntry {
    /// When the compile was started.
    pub compile_time: SystemTime,
    /// Source path compiled.
    pub real: PathBuf,
    /// Extension of the produced content.
    pub target_ext: String,
    /// Pending or settled output.
    pub artifact: Arc<PendingArtifact>,
    /// Whether a file handle has been attached to this entry.
    pub opened: bool,
    compiler: SharedCompiler,
}

impl CacheEntry {
    /// Whether the settled artifact holds error content.
    pub fn is_failed(&self) -> bool {
        self.artifact.peek().is_some_and(|a| a.is_failed())
    }
}

// =============================================================================
// CompileCache
// =============================================================================

/// Compiled-output cache with at-most-one compile per key.
pub struct CompileCache {
    root: PathBuf,
    maps: Arc<ExtensionMaps>,
    options: CompileOptions,
    events: EventBus,
    entries: Mutex<FxHashMap<String, CacheEntry>>,
    pool: rayon::ThreadPool,
}

impl CompileCache {
    /// Create a cache compiling with `threads` workers.
    pub fn new(
        root: impl Into<PathBuf>,
        maps: Arc<ExtensionMaps>,
        options: CompileOptions,
        threads: usize,
        events: EventBus,
    ) -> Result<Self, FsError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("compile-{i}"))
            .build()
            .map_err(|e| FsError::Mount(format!("cannot start compile pool: {e}")))?;

        Ok(Self {
            root: root.into(),
            maps,
            options,
            events,
            entries: Mutex::new(FxHashMap::default()),
            pool,
        })
    }

    /// Whether some compiler produces the extension of `virtual_path`.
    pub fn should_compile(&self, virtual_path: &str) -> bool {
        extension_of(virtual_path).is_some_and(|ext| self.maps.is_target(&ext))
    }

    /// Compiler and target extension for serving `real` as `virtual_path`.
    pub fn compiler_for(
        &self,
        virtual_path: &str,
        real: &Path,
    ) -> Option<(SharedCompiler, String)> {
        let target = extension_of(virtual_path)?;
        let source = extension_of(real)?;
        let compiler = self.maps.compiler_for(&source, &target)?;
        Some((compiler, target))
    }

    /// Get the artifact for `key`, starting a compile when the cached one is
    /// missing, stale, or a failure already delivered to a handle.
    ///
    /// Returns `None` when `real` is not compiled for this key (pass-through).
    pub fn acquire(&self, key: &str, real: &Path, access: Access) -> Option<Arc<PendingArtifact>> {
        let (compiler, target_ext) = self.compiler_for(key, real)?;

        loop {
            let seen = self.entries.lock().get(key).cloned();

            if let Some(entry) = &seen
                && self.reusable(entry, real, access)
            {
                if access == Access::Open {
                    self.mark_opened(key, &entry.artifact);
                    self.events.emit(FsEvent::CacheHit { path: key.to_string() });
                }
                return Some(Arc::clone(&entry.artifact));
            }

            let mut entries = self.entries.lock();
            let unchanged = match (entries.get(key), &seen) {
                (Some(now), Some(seen)) => Arc::ptr_eq(&now.artifact, &seen.artifact),
                (None, None) => true,
                _ => false,
            };
            if !unchanged {
                // Someone replaced the entry while we checked freshness.
                continue;
            }

            let entry = CacheEntry {
                compile_time: SystemTime::now(),
                real: real.to_path_buf(),
                target_ext,
                artifact: Arc::new(PendingArtifact::new()),
                opened: access == Access::Open,
                compiler,
            };
            entries.insert(key.to_string(), entry.clone());
            drop(entries);

            self.events.emit(FsEvent::CacheMiss { path: key.to_string() });
            self.spawn(key, &entry);
            return Some(entry.artifact);
        }
    }

    fn reusable(&self, entry: &CacheEntry, real: &Path, access: Access) -> bool {
        if entry.real != real {
            return false;
        }
        match entry.artifact.peek() {
            None => true,
            Some(artifact) if artifact.is_failed() && access == Access::Open && entry.opened => {
                false
            }
            Some(artifact) => is_fresh(entry.compile_time, real, &artifact.imports),
        }
    }

    fn mark_opened(&self, key: &str, artifact: &Arc<PendingArtifact>) {
        if let Some(entry) = self.entries.lock().get_mut(key)
            && Arc::ptr_eq(&entry.artifact, artifact)
        {
            entry.opened = true;
        }
    }

    fn spawn(&self, key: &str, entry: &CacheEntry) {
        let job = CompileJob {
            key: key.to_string(),
            real: entry.real.clone(),
            target_ext: entry.target_ext.clone(),
            compiler: Arc::clone(&entry.compiler),
            artifact: Arc::clone(&entry.artifact),
            root: self.root.clone(),
            maps: Arc::clone(&self.maps),
            options: self.options.clone(),
            events: self.events.clone(),
        };
        self.pool.spawn(move || job.run());
    }

    /// Current artifact for `key`, if any.
    pub fn artifact(&self, key: &str) -> Option<Arc<PendingArtifact>> {
        self.entries.lock().get(key).map(|e| Arc::clone(&e.artifact))
    }

    /// Snapshot of the entry for `key`.
    pub fn entry(&self, key: &str) -> Option<CacheEntry> {
        self.entries.lock().get(key).cloned()
    }

    /// Handle for `key` closed: purge the entry if it holds a failure so the
    /// next open retries.
    pub fn release(&self, key: &str) {
        let removed = {
            let mut entries = self.entries.lock();
            match entries.get(key) {
                Some(entry) if entry.is_failed() => entries.remove(key).is_some(),
                _ => false,
            }
        };
        if removed {
            self.events.emit(FsEvent::Invalidated { path: key.to_string() });
        }
    }

    /// Drop the entry for `key`. Returns whether one existed.
    pub fn invalidate(&self, key: &str) -> bool {
        let removed = self.entries.lock().remove(key).is_some();
        if removed {
            self.events.emit(FsEvent::Invalidated { path: key.to_string() });
        }
        removed
    }

    /// Recompile `key` now if it is cached. Returns whether a compile started.
    pub fn refresh(&self, key: &str) -> bool {
        let entry = {
            let mut entries = self.entries.lock();
            let Some(old) = entries.get(key) else {
                return false;
            };
            let entry = CacheEntry {
                compile_time: SystemTime::now(),
                artifact: Arc::new(PendingArtifact::new()),
                opened: false,
                ..old.clone()
            };
            entries.insert(key.to_string(), entry.clone());
            entry
        };
        self.events.emit(FsEvent::CacheMiss { path: key.to_string() });
        self.spawn(key, &entry);
        true
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Whether `key` has an entry.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Compile Job
// =============================================================================

/// Everything a worker needs to settle one artifact.
struct CompileJob {
    key: String,
    real: PathBuf,
    target_ext: String,
    compiler: SharedCompiler,
    artifact: Arc<PendingArtifact>,
    root: PathBuf,
    maps: Arc<ExtensionMaps>,
    options: CompileOptions,
    events: EventBus,
}

impl CompileJob {
    fn run(self) {
        tracing::debug!(path = %self.key, source = %self.real.display(), "compiling");

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.compiler.compile(&self.real, &self.options)
        }))
        .unwrap_or_else(|payload| {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "compiler panicked".to_string());
            Err(CompileFailure::new(&self.real, message))
        })
        .and_then(|compiled| self.post_process(compiled));

        match result {
            Ok(compiled) => {
                self.artifact
                    .settle(Artifact::compiled(compiled.output.into_bytes(), compiled.imports));
            }
            Err(failure) => {
                // Emitted before settling: waiters may release and purge right away.
                let content = render_failure(&self.target_ext, &failure, &self.root);
                self.events.emit(FsEvent::CompileFailed {
                    path: self.key,
                    failure: failure.clone(),
                });
                self.artifact.settle(Artifact::failed(content, failure));
            }
        }
    }

    fn post_process(&self, mut compiled: Compiled) -> Result<Compiled, CompileFailure> {
        for processor in self.maps.post_processors(&self.target_ext) {
            compiled.output = processor
                .process(compiled.output, &self.options)
                .map_err(|message| {
                    CompileFailure::new(&self.real, message).with_imports(compiled.imports.clone())
                })?;
        }
        Ok(compiled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{Compiler, CompilerRegistry, PostProcessor};
    use std::fs::{self, File};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Uppercases the source; fails on sources containing `!`.
    struct Upper {
        calls: Arc<AtomicUsize>,
        delay: Duration,
    }

    impl Compiler for Upper {
        fn source_ext(&self) -> &str {
            ".up"
        }
        fn output_ext(&self) -> &str {
            ".txt"
        }
        fn compile(&self, path: &Path, _: &CompileOptions) -> Result<Compiled, CompileFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            let text =
                fs::read_to_string(path).map_err(|e| CompileFailure::new(path, e.to_string()))?;
            if text.contains('!') {
                return Err(CompileFailure::new(path, "bang").at(1, Some(1)));
            }
            let deps = path.with_file_name("dep.inc");
            let imports = if deps.exists() { vec![deps] } else { vec![] };
            Ok(Compiled::new(text.to_uppercase()).with_imports(imports))
        }
    }

    struct Suffix;

    impl PostProcessor for Suffix {
        fn target_ext(&self) -> &str {
            ".txt"
        }
        fn process(&self, output: String, _: &CompileOptions) -> Result<String, String> {
            Ok(output + ";")
        }
    }

    fn cache(dir: &TempDir, delay: Duration) -> (CompileCache, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = CompilerRegistry::new().with(Upper {
            calls: Arc::clone(&calls),
            delay,
        });
        let maps = Arc::new(ExtensionMaps::build(&registry));
        let options = CompileOptions::default();
        let cache = CompileCache::new(dir.path(), maps, options, 2, EventBus::new()).unwrap();
        (cache, calls)
    }

    fn backdate(path: &Path) {
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(60))
            .unwrap();
    }

    fn touch_future(path: &Path) {
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(SystemTime::now() + Duration::from_secs(60))
            .unwrap();
    }

    #[test]
    fn test_should_compile() {
        let dir = TempDir::new().unwrap();
        let (cache, _) = cache(&dir, Duration::ZERO);
        assert!(cache.should_compile("/a.txt"));
        assert!(!cache.should_compile("/a.up"));
        assert!(!cache.should_compile("/Makefile"));
    }

    #[test]
    fn test_compiles_once_and_reuses() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a.up");
        fs::write(&src, "hi").unwrap();
        backdate(&src);
        let (cache, calls) = cache(&dir, Duration::ZERO);

        let first = cache.acquire("/a.txt", &src, Access::Open).unwrap().wait();
        assert_eq!(first.content, b"HI");
        let second = cache.acquire("/a.txt", &src, Access::Open).unwrap().wait();
        assert_eq!(second.content, b"HI");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_passthrough_not_acquired() {
        let dir = TempDir::new().unwrap();
        let (cache, _) = cache(&dir, Duration::ZERO);
        assert!(cache.acquire("/a.md", &dir.path().join("a.md"), Access::Open).is_none());
    }

    #[test]
    fn test_concurrent_acquire_single_compile() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a.up");
        fs::write(&src, "hi").unwrap();
        backdate(&src);
        let (cache, calls) = cache(&dir, Duration::from_millis(50));
        let cache = Arc::new(cache);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let src = src.clone();
                std::thread::spawn(move || {
                    cache.acquire("/a.txt", &src, Access::Open).unwrap().wait()
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap().content, b"HI");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stale_source_and_dependency_recompile() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a.up");
        let dep = dir.path().join("dep.inc");
        fs::write(&src, "hi").unwrap();
        fs::write(&dep, "").unwrap();
        backdate(&src);
        backdate(&dep);
        let (cache, calls) = cache(&dir, Duration::ZERO);

        cache.acquire("/a.txt", &src, Access::Open).unwrap().wait();
        touch_future(&src);
        cache.acquire("/a.txt", &src, Access::Open).unwrap().wait();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        backdate(&src);
        let art = cache.acquire("/a.txt", &src, Access::Open).unwrap().wait();
        assert_eq!(art.imports, vec![dep.clone()]);
        let before = calls.load(Ordering::SeqCst);
        touch_future(&dep);
        cache.acquire("/a.txt", &src, Access::Open).unwrap().wait();
        assert_eq!(calls.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn test_failure_rendered_and_purged_on_release() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("bad.up");
        fs::write(&src, "oops!").unwrap();
        backdate(&src);
        let (cache, calls) = cache(&dir, Duration::ZERO);

        let art = cache.acquire("/bad.txt", &src, Access::Stat).unwrap().wait();
        assert!(art.is_failed());
        let text = String::from_utf8(art.content.clone()).unwrap();
        assert_eq!(text, "Transpiler error: /bad.up:1:1\nbang");

        // the open reuses the failure the stat produced
        let opened = cache.acquire("/bad.txt", &src, Access::Open).unwrap().wait();
        assert!(Arc::ptr_eq(&art, &opened));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cache.release("/bad.txt");
        assert!(!cache.contains("/bad.txt"));

        fs::write(&src, "fixed").unwrap();
        let art = cache.acquire("/bad.txt", &src, Access::Open).unwrap().wait();
        assert_eq!(art.content, b"FIXED");
        cache.release("/bad.txt");
        assert!(cache.contains("/bad.txt"));
    }

    #[test]
    fn test_failure_event_precedes_release() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("bad.up");
        fs::write(&src, "oops!").unwrap();
        backdate(&src);
        let registry = CompilerRegistry::new().with(Upper {
            calls: Arc::new(AtomicUsize::new(0)),
            delay: Duration::from_millis(20),
        });
        let events = EventBus::new();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        events.subscribe(move |e| sink.lock().push(e.clone()));
        let maps = Arc::new(ExtensionMaps::build(&registry));
        let options = CompileOptions::default();
        let cache = CompileCache::new(dir.path(), maps, options, 1, events).unwrap();

        let art = cache.acquire("/bad.txt", &src, Access::Open).unwrap().wait();
        assert!(art.is_failed());
        cache.release("/bad.txt");

        let kinds: Vec<_> = seen
            .lock()
            .iter()
            .map(|e| match e {
                FsEvent::CacheMiss { .. } => "miss",
                FsEvent::CompileFailed { .. } => "failed",
                FsEvent::Invalidated { .. } => "invalidated",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, ["miss", "failed", "invalidated"]);
    }

    #[test]
    fn test_delivered_failure_retried_on_open() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("bad.up");
        fs::write(&src, "oops!").unwrap();
        backdate(&src);
        let (cache, calls) = cache(&dir, Duration::ZERO);

        cache.acquire("/bad.txt", &src, Access::Open).unwrap().wait();
        cache.acquire("/bad.txt", &src, Access::Open).unwrap().wait();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_post_processor_applies() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a.up");
        fs::write(&src, "x").unwrap();
        let registry = CompilerRegistry::new()
            .with(Upper {
                calls: Arc::new(AtomicUsize::new(0)),
                delay: Duration::ZERO,
            })
            .with_post_processor(Suffix);
        let maps = Arc::new(ExtensionMaps::build(&registry));
        let options = CompileOptions::default();
        let cache = CompileCache::new(dir.path(), maps, options, 1, EventBus::new()).unwrap();

        let art = cache.acquire("/a.txt", &src, Access::Open).unwrap().wait();
        assert_eq!(art.content, b"X;");

        // verbatim target files go through post-processing as well
        let plain = dir.path().join("b.txt");
        fs::write(&plain, "raw").unwrap();
        let art = cache.acquire("/b.txt", &plain, Access::Open).unwrap().wait();
        assert_eq!(art.content, b"raw;");
    }

    #[test]
    fn test_invalidate_refresh_clear() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a.up");
        fs::write(&src, "hi").unwrap();
        let (cache, calls) = cache(&dir, Duration::ZERO);

        assert!(!cache.refresh("/a.txt"));
        cache.acquire("/a.txt", &src, Access::Open).unwrap().wait();
        assert!(cache.refresh("/a.txt"));
        cache.artifact("/a.txt").unwrap().wait();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        assert!(cache.invalidate("/a.txt"));
        assert!(!cache.invalidate("/a.txt"));
        cache.acquire("/a.txt", &src, Access::Open).unwrap().wait();
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }
}
