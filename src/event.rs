//! Observable mount events.
//!
//! Everything noteworthy the mount does (cache hits, compile failures, change
//! notifications) is published as an [`FsEvent`]. Events are always logged
//! through `tracing`; listeners registered on the [`EventBus`] receive them
//! synchronously on whichever thread raised them.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::compiler::CompileFailure;

/// Something the mount did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEvent {
    /// An open reused a cached artifact.
    CacheHit {
        /// Virtual path.
        path: String,
    },
    /// A compile was started.
    CacheMiss {
        /// Virtual path.
        path: String,
    },
    /// A compile failed; error content is served instead.
    CompileFailed {
        /// Virtual path.
        path: String,
        /// The failure.
        failure: CompileFailure,
    },
    /// A cache entry was dropped.
    Invalidated {
        /// Virtual path.
        path: String,
    },
    /// A watched source changed; the virtual mtime was bumped.
    SourceChanged {
        /// Virtual path.
        path: String,
    },
    /// A path could not be registered for change notification.
    WatchFailed {
        /// Real path.
        path: String,
        /// Watcher error message.
        error: String,
    },
}

impl FsEvent {
    /// The path the event concerns.
    pub fn path(&self) -> &str {
        match self {
            Self::CacheHit { path }
            | Self::CacheMiss { path }
            | Self::CompileFailed { path, .. }
            | Self::Invalidated { path }
            | Self::SourceChanged { path }
            | Self::WatchFailed { path, .. } => path,
        }
    }

    fn log(&self) {
        match self {
            Self::CacheHit { path } => tracing::debug!(%path, "cache hit"),
            Self::CacheMiss { path } => tracing::debug!(%path, "cache miss"),
            Self::CompileFailed { path, failure } => {
                tracing::warn!(%path, error = %failure, "compile failed")
            }
            Self::Invalidated { path } => tracing::debug!(%path, "cache entry invalidated"),
            Self::SourceChanged { path } => tracing::info!(%path, "source changed"),
            Self::WatchFailed { path, error } => {
                tracing::warn!(%path, %error, "failed to watch path")
            }
        }
    }
}

type Listener = Arc<dyn Fn(&FsEvent) + Send + Sync>;

/// Fan-out of events to registered listeners.
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<RwLock<Vec<Listener>>>,
}

impl EventBus {
    /// Create a bus with no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener.
    pub fn subscribe(&self, listener: impl Fn(&FsEvent) + Send + Sync + 'static) {
        self.listeners.write().push(Arc::new(listener));
    }

    /// Log and deliver an event.
    pub fn emit(&self, event: FsEvent) {
        event.log();
        // Snapshot so a listener may subscribe without deadlocking.
        let listeners: Vec<Listener> = self.listeners.read().clone();
        for listener in listeners {
            listener(&event);
        }
    }
}
