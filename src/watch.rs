//! Change-notification bridge.
//!
//! ```text
//! open(/css/site.css)  ──matches watch pattern──►  watch(<root>/css/site.scss)
//!                                                         │
//!  notify::RecommendedWatcher ──Event──► bridge thread ◄──┘
//!                                            │
//!            Modify/Create ──► invalidate (or recompile with prewarm)
//!                              + bump virtual mtime + SourceChanged
//!            Remove/Rename ──► unwatch + invalidate + forget mapping
//! ```
//!
//! Watches are registered per real file, not per directory. After a delete
//! or rename the path is dropped and the next open of the owning virtual
//! path registers it again.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::SystemTime;

use glob::{MatchOptions, Pattern};
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::cache::CompileCache;
use crate::config::normalize_pattern;
use crate::error::WatchError;
use crate::event::{EventBus, FsEvent};
use crate::translate::PathTranslator;

// =============================================================================
// Watch Patterns
// =============================================================================

const MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Compiled watch patterns.
#[derive(Debug, Clone, Default)]
pub struct WatchSet {
    patterns: Vec<Pattern>,
}

impl WatchSet {
    /// Compile patterns, normalizing each to start with `/`.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, WatchError> {
        let patterns = patterns
            .iter()
            .map(|p| {
                let pattern = normalize_pattern(p.as_ref());
                Pattern::new(&pattern).map_err(|source| WatchError::Pattern { pattern, source })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Whether `path` (rooted at `/`) matches any pattern.
    pub fn matches(&self, path: &str) -> bool {
        self.patterns.iter().any(|p| p.matches_with(path, MATCH))
    }

    /// Whether no pattern is configured.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

// =============================================================================
// Bridge State
// =============================================================================

struct BridgeState {
    watcher: Mutex<Option<RecommendedWatcher>>,
    /// Real path → virtual paths it backs or is imported by.
    watched: Mutex<FxHashMap<PathBuf, FxHashSet<String>>>,
    /// Virtual path → the source file backing it.
    sources: Mutex<FxHashMap<String, PathBuf>>,
    touched: Mutex<FxHashMap<String, SystemTime>>,
    cache: Arc<CompileCache>,
    translator: Arc<PathTranslator>,
    events: EventBus,
    prewarm: bool,
}

impl BridgeState {
    fn register(&self, real: &Path, virtual_path: &str) {
        let newly = {
            let mut watched = self.watched.lock();
            let owners = watched.entry(real.to_path_buf()).or_default();
            let newly = owners.is_empty();
            owners.insert(virtual_path.to_string());
            newly
        };
        if !newly {
            return;
        }

        let result = match self.watcher.lock().as_mut() {
            Some(watcher) => watcher.watch(real, RecursiveMode::NonRecursive),
            None => return,
        };
        match result {
            Ok(()) => tracing::debug!(path = %real.display(), virtual_path, "watching"),
            Err(source) => {
                self.watched.lock().remove(real);
                let error = WatchError::Notify {
                    path: real.to_path_buf(),
                    source,
                };
                self.events.emit(FsEvent::WatchFailed {
                    path: real.display().to_string(),
                    error: error.to_string(),
                });
            }
        }
    }

    fn unregister(&self, real: &Path) -> FxHashSet<String> {
        let owners = self.watched.lock().remove(real).unwrap_or_default();
        if let Some(watcher) = self.watcher.lock().as_mut() {
            // The path may already be gone; the watch died with it.
            if let Err(e) = watcher.unwatch(real) {
                tracing::trace!(path = %real.display(), error = %e, "unwatch");
            }
        }
        owners
    }

    /// Forget everything recorded for `virtual_path` once its source is gone.
    fn drop_owner(&self, virtual_path: &str) {
        self.sources.lock().remove(virtual_path);
        self.touched.lock().remove(virtual_path);
        let orphaned: Vec<PathBuf> = self
            .watched
            .lock()
            .iter_mut()
            .filter_map(|(path, owners)| {
                (owners.remove(virtual_path) && owners.is_empty()).then(|| path.clone())
            })
            .collect();
        for path in orphaned {
            self.unregister(&path);
        }
    }

    fn handle(&self, event: Event) {
        let removed = match event.kind {
            EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_)) => true,
            EventKind::Create(_) | EventKind::Modify(_) => false,
            _ => return,
        };

        for real in &event.paths {
            let owners = if removed {
                self.unregister(real)
            } else {
                match self.watched.lock().get(real) {
                    Some(owners) => owners.clone(),
                    None => continue,
                }
            };

            for virtual_path in owners {
                if removed {
                    self.translator.forget(&virtual_path);
                    self.cache.invalidate(&virtual_path);
                } else if !(self.prewarm && self.cache.refresh(&virtual_path)) {
                    self.cache.invalidate(&virtual_path);
                }
                if removed && self.sources.lock().get(&virtual_path) == Some(real) {
                    self.drop_owner(&virtual_path);
                } else {
                    self.touched.lock().insert(virtual_path.clone(), SystemTime::now());
                }
                self.events.emit(FsEvent::SourceChanged { path: virtual_path });
            }
        }
    }
}

// =============================================================================
// ChangeBridge
// =============================================================================

/// Connects the platform watcher to the cache.
pub struct ChangeBridge {
    patterns: WatchSet,
    state: Arc<BridgeState>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ChangeBridge {
    /// Start a bridge. With no patterns no watcher is created.
    ///
    /// Failure to create the platform watcher is logged and leaves the mount
    /// without live invalidation.
    pub fn new(
        patterns: WatchSet,
        cache: Arc<CompileCache>,
        translator: Arc<PathTranslator>,
        events: EventBus,
        prewarm: bool,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<notify::Result<Event>>();

        let watcher = if patterns.is_empty() {
            None
        } else {
            match RecommendedWatcher::new(tx, notify::Config::default()) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    let error = WatchError::Unavailable(e);
                    tracing::warn!(%error, "continuing without live invalidation");
                    None
                }
            }
        };
        let active = watcher.is_some();

        let state = Arc::new(BridgeState {
            watcher: Mutex::new(watcher),
            watched: Mutex::new(FxHashMap::default()),
            sources: Mutex::new(FxHashMap::default()),
            touched: Mutex::new(FxHashMap::default()),
            cache,
            translator,
            events,
            prewarm,
        });

        let thread = active.then(|| {
            let state = Arc::clone(&state);
            thread::Builder::new()
                .name("transpile-fs-watch".into())
                .spawn(move || {
                    // Ends once the watcher (and its sender) is dropped.
                    for result in rx {
                        match result {
                            Ok(event) => state.handle(event),
                            Err(e) => tracing::warn!(error = %e, "watcher error"),
                        }
                    }
                })
        });
        let thread = match thread {
            Some(Ok(handle)) => Some(handle),
            Some(Err(e)) => {
                tracing::warn!(error = %e, "cannot start watch thread");
                state.watcher.lock().take();
                None
            }
            None => None,
        };

        Self {
            patterns,
            state,
            thread: Mutex::new(thread),
        }
    }

    /// Watch patterns in effect.
    pub fn patterns(&self) -> &WatchSet {
        &self.patterns
    }

    /// Whether `virtual_path` backed by `real` is covered by a pattern.
    pub fn covers(&self, virtual_path: &str, real: &Path) -> bool {
        if self.patterns.matches(virtual_path) {
            return true;
        }
        let root = self.state.translator.root();
        real.strip_prefix(root)
            .ok()
            .and_then(|rel| rel.to_str())
            .is_some_and(|rel| self.patterns.matches(&format!("/{rel}")))
    }

    /// Register `real` for change notification on behalf of `virtual_path`
    /// if a pattern covers it. Re-registering is a no-op.
    pub fn watch(&self, virtual_path: &str, real: &Path) {
        if self.covers(virtual_path, real) {
            self.state
                .sources
                .lock()
                .insert(virtual_path.to_string(), real.to_path_buf());
            self.state.register(real, virtual_path);
        }
    }

    /// Register the dependencies of a covered compiled path.
    pub fn watch_imports(&self, virtual_path: &str, real: &Path, imports: &[PathBuf]) {
        if !self.covers(virtual_path, real) {
            return;
        }
        for import in imports {
            self.state.register(import, virtual_path);
        }
    }

    /// Whether `real` is currently registered.
    pub fn is_watched(&self, real: &Path) -> bool {
        self.state.watched.lock().contains_key(real)
    }

    /// Modification time recorded for `virtual_path` by the last change event.
    pub fn touched_mtime(&self, virtual_path: &str) -> Option<SystemTime> {
        self.state.touched.lock().get(virtual_path).copied()
    }

    /// Process one watcher event synchronously.
    pub fn handle_event(&self, event: Event) {
        self.state.handle(event);
    }

    /// Drop every watch and stop the bridge thread.
    pub fn close(&self) {
        let watcher = self.state.watcher.lock().take();
        drop(watcher);
        self.state.watched.lock().clear();
        self.state.sources.lock().clear();
        if let Some(handle) = self.thread.lock().take()
            && handle.join().is_err()
        {
            tracing::error!("watch thread panicked");
        }
    }
}

impl Drop for ChangeBridge {
    fn drop(&mut self) {
        self.close();
    }
}
