//! Pending-or-settled compile results.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::compiler::CompileFailure;

/// Settled output of one compile.
#[derive(Debug)]
pub struct Artifact {
    /// Bytes served to readers: compiled output or rendered error content.
    pub content: Vec<u8>,
    /// Dependencies declared by the compile (empty for verbatim files).
    pub imports: Vec<PathBuf>,
    /// Set when the compile failed and `content` is error content.
    pub failure: Option<CompileFailure>,
}

impl Artifact {
    /// Successful artifact.
    pub fn compiled(content: Vec<u8>, imports: Vec<PathBuf>) -> Self {
        Self {
            content,
            imports,
            failure: None,
        }
    }

    /// Failed artifact carrying rendered error content.
    pub fn failed(content: Vec<u8>, failure: CompileFailure) -> Self {
        Self {
            content,
            imports: failure.imports.clone(),
            failure: Some(failure),
        }
    }

    /// Whether this artifact holds error content.
    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Content length in bytes.
    pub fn len(&self) -> u64 {
        self.content.len() as u64
    }

    /// Whether the content is empty.
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Slice `[offset, offset + size)`, clamped to the content.
    pub fn slice(&self, offset: u64, size: u32) -> &[u8] {
        let len = self.content.len();
        let start = usize::try_from(offset).map_or(len, |o| o.min(len));
        let end = start.saturating_add(size as usize).min(len);
        &self.content[start..end]
    }
}

/// A compile that may still be running.
///
/// Every opener of the same cache entry shares one `PendingArtifact`; readers
/// block in [`PendingArtifact::wait`] until the compile settles it.
#[derive(Debug, Default)]
pub struct PendingArtifact {
    state: Mutex<Option<Arc<Artifact>>>,
    settled: Condvar,
}

impl PendingArtifact {
    /// Unsettled artifact.
    pub fn new() -> Self {
        Self::default()
    }

    /// Settle with `artifact` and wake all waiters. Later calls are ignored.
    pub fn settle(&self, artifact: Artifact) {
        let mut state = self.state.lock();
        if state.is_none() {
            *state = Some(Arc::new(artifact));
            self.settled.notify_all();
        }
    }

    /// The artifact, if settled.
    pub fn peek(&self) -> Option<Arc<Artifact>> {
        self.state.lock().clone()
    }

    /// Block until settled.
    pub fn wait(&self) -> Arc<Artifact> {
        let mut state = self.state.lock();
        loop {
            if let Some(artifact) = state.as_ref() {
                return Arc::clone(artifact);
            }
            self.settled.wait(&mut state);
        }
    }
}
