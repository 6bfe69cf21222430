//! Filesystem request handlers.
//!
//! [`TranspileFs`] owns every piece of per-mount state and answers
//! path-based requests. It knows nothing about the kernel transport; the
//! `fuse` module adapts it to `fuser`, and tests drive it directly.
//!
//! ```text
//! getattr ─► resolve_stat ─► dir / pass-through stat
//!                          └► compiled: acquire(Stat) ─► wait ─► size = output len
//! readdir ─► read_dir(real) ─► rewrite_listing
//! open    ─► resolve_stat ─► acquire(Open) ─► Compiled handle
//!                          └► not compiled  ─► Raw handle (File)
//! read    ─► artifact for key (wait) ─► slice
//!          └► raw handle ─► read_at
//! release ─► drop handle ─► watch imports ─► purge failed entry
//! write, unlink, rename, ... ─► EPERM
//! ```

use std::fs::{self, File, Metadata};
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::cache::{Access, CompileCache, PendingArtifact, mtime};
use crate::compiler::{CompileOptions, CompilerRegistry, ExtensionMaps};
use crate::config::MountOptions;
use crate::error::FsError;
use crate::event::{EventBus, FsEvent};
use crate::translate::PathTranslator;
use crate::watch::{ChangeBridge, WatchSet};

/// Placeholder value reported for every `statfs` counter.
pub const STATFS_PLACEHOLDER: u64 = 1_000_000;

// =============================================================================
// Reply Types
// =============================================================================

/// Kind of a filesystem node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
    /// Anything else (fifo, socket, device).
    Other,
}

impl FileKind {
    fn of(file_type: fs::FileType) -> Self {
        if file_type.is_dir() {
            Self::Directory
        } else if file_type.is_file() {
            Self::File
        } else if file_type.is_symlink() {
            Self::Symlink
        } else {
            Self::Other
        }
    }
}

/// Attributes of a virtual path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    /// Node kind.
    pub kind: FileKind,
    /// Size in bytes (compiled length for compiled files).
    pub size: u64,
    /// 512-byte blocks.
    pub blocks: u64,
    /// Last access.
    pub atime: SystemTime,
    /// Last modification, bumped by change notification.
    pub mtime: SystemTime,
    /// Last status change.
    pub ctime: SystemTime,
    /// Permission bits with write access removed.
    pub perm: u16,
    /// Hard links.
    pub nlink: u32,
    /// Owner.
    pub uid: u32,
    /// Group.
    pub gid: u32,
    /// Device id for special files.
    pub rdev: u32,
    /// Preferred I/O block size.
    pub blksize: u32,
}

impl FileStat {
    fn from_metadata(metadata: &Metadata) -> Self {
        let mtime = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        Self {
            kind: FileKind::of(metadata.file_type()),
            size: metadata.len(),
            blocks: metadata.blocks(),
            atime: metadata.accessed().unwrap_or(mtime),
            mtime,
            ctime: ctime_of(metadata).unwrap_or(mtime),
            perm: (metadata.mode() & 0o7777 & !0o222) as u16,
            nlink: metadata.nlink() as u32,
            uid: metadata.uid(),
            gid: metadata.gid(),
            rdev: metadata.rdev() as u32,
            blksize: metadata.blksize() as u32,
        }
    }

    fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self.blocks = size.div_ceil(512);
        self
    }

    fn touched(mut self, at: Option<SystemTime>) -> Self {
        if let Some(at) = at
            && at > self.mtime
        {
            self.mtime = at;
            self.ctime = self.ctime.max(at);
        }
        self
    }
}

fn ctime_of(metadata: &Metadata) -> Option<SystemTime> {
    let secs = u64::try_from(metadata.ctime()).ok()?;
    let nanos = u32::try_from(metadata.ctime_nsec()).ok()?;
    SystemTime::UNIX_EPOCH.checked_add(std::time::Duration::new(secs, nanos))
}

/// One directory entry under its virtual name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Virtual name.
    pub name: String,
    /// Node kind.
    pub kind: FileKind,
}

/// Filesystem statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    /// Total blocks.
    pub blocks: u64,
    /// Free blocks.
    pub bfree: u64,
    /// Blocks available to unprivileged users.
    pub bavail: u64,
    /// Total inodes.
    pub files: u64,
    /// Free inodes.
    pub ffree: u64,
    /// Block size.
    pub bsize: u32,
    /// Maximum name length.
    pub namelen: u32,
    /// Fragment size.
    pub frsize: u32,
}

impl Default for StatFs {
    fn default() -> Self {
        Self {
            blocks: STATFS_PLACEHOLDER,
            bfree: STATFS_PLACEHOLDER,
            bavail: STATFS_PLACEHOLDER,
            files: STATFS_PLACEHOLDER,
            ffree: STATFS_PLACEHOLDER,
            bsize: STATFS_PLACEHOLDER as u32,
            namelen: 255,
            frsize: STATFS_PLACEHOLDER as u32,
        }
    }
}

// =============================================================================
// Open Handles
// =============================================================================

enum OpenFile {
    /// Pass-through file read from disk.
    Raw { path: String, file: File },
    /// Compiled file served from an artifact.
    Compiled {
        path: String,
        real: PathBuf,
        artifact: Arc<PendingArtifact>,
    },
}

enum ReadSource {
    Artifact(Arc<PendingArtifact>),
    File(File),
}

impl OpenFile {
    fn path(&self) -> &str {
        match self {
            Self::Raw { path, .. } | Self::Compiled { path, .. } => path,
        }
    }
}

// =============================================================================
// TranspileFs
// =============================================================================

/// State of one mount and its request handlers.
pub struct TranspileFs {
    root: PathBuf,
    options: MountOptions,
    events: EventBus,
    translator: Arc<PathTranslator>,
    cache: Arc<CompileCache>,
    bridge: ChangeBridge,
    handles: Mutex<FxHashMap<u64, OpenFile>>,
    next_handle: AtomicU64,
}

impl TranspileFs {
    /// Set up a mount of `root` with the given compilers.
    ///
    /// Fails if `root` is not a directory or a watch pattern is invalid.
    pub fn new(
        root: impl AsRef<Path>,
        registry: &CompilerRegistry,
        options: MountOptions,
    ) -> Result<Self, FsError> {
        let root = root.as_ref();
        let root = root.canonicalize().map_err(|e| FsError::io(root, e))?;
        if !root.is_dir() {
            return Err(FsError::NotADirectory(root.display().to_string()));
        }

        let patterns = WatchSet::new(&options.watches)?;
        let events = EventBus::new();
        let maps = Arc::new(ExtensionMaps::build(registry));
        let translator = Arc::new(PathTranslator::new(root.clone(), Arc::clone(&maps)));
        let cache = Arc::new(CompileCache::new(
            root.clone(),
            maps,
            CompileOptions::from(&options),
            options.compile_threads,
            events.clone(),
        )?);
        let bridge = ChangeBridge::new(
            patterns,
            Arc::clone(&cache),
            Arc::clone(&translator),
            events.clone(),
            options.prewarm,
        );

        tracing::info!(
            root = %root.display(),
            compilers = registry.len(),
            watches = options.watches.len(),
            "mount state ready"
        );

        Ok(Self {
            root,
            options,
            events,
            translator,
            cache,
            bridge,
            handles: Mutex::new(FxHashMap::default()),
            next_handle: AtomicU64::new(1),
        })
    }

    /// Canonical source root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Options the mount was created with.
    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    /// The compile cache.
    pub fn cache(&self) -> &CompileCache {
        &self.cache
    }

    /// The path translator.
    pub fn translator(&self) -> &PathTranslator {
        &self.translator
    }

    /// The change-notification bridge.
    pub fn bridge(&self) -> &ChangeBridge {
        &self.bridge
    }

    /// Register an event listener.
    pub fn subscribe(&self, listener: impl Fn(&FsEvent) + Send + Sync + 'static) {
        self.events.subscribe(listener);
    }

    /// Number of open handles.
    pub fn open_handles(&self) -> usize {
        self.handles.lock().len()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Mount is live.
    pub fn init(&self) {
        tracing::info!(root = %self.root.display(), "filesystem initialized");
    }

    /// Mount is going away: stop watching and drop all state.
    pub fn destroy(&self) {
        self.bridge.close();
        self.handles.lock().clear();
        self.cache.clear();
        tracing::info!(root = %self.root.display(), "filesystem destroyed");
    }

    /// Per-request diagnostics, promoted to `info` in verbose mode.
    fn log_request(&self, op: &'static str, path: &str) {
        if self.options.verbose {
            tracing::info!(op, path, "request");
        } else {
            tracing::trace!(op, path, "request");
        }
    }

    // =========================================================================
    // Read Handlers
    // =========================================================================

    /// Attributes of `path`.
    ///
    /// For compiled paths this waits for the compile so the size is exact.
    pub fn getattr(&self, path: &str) -> Result<FileStat, FsError> {
        self.log_request("getattr", path);
        let (real, metadata) = self.translator.resolve_stat(path)?;
        let stat = FileStat::from_metadata(&metadata);
        if !metadata.is_file() {
            return Ok(stat);
        }

        let stat = match self.cache.acquire(path, &real, Access::Stat) {
            Some(pending) => {
                let artifact = pending.wait();
                let newest = artifact.imports.iter().filter_map(|dep| mtime(dep)).max();
                stat.with_size(artifact.len()).touched(newest)
            }
            None => stat,
        };
        Ok(stat.touched(self.bridge.touched_mtime(path)))
    }

    /// Entries of directory `path` under their virtual names.
    pub fn readdir(&self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        self.log_request("readdir", path);
        let (real, metadata) = self.translator.resolve_stat(path)?;
        if !metadata.is_dir() {
            return Err(FsError::NotADirectory(path.to_string()));
        }

        let mut listing = Vec::new();
        for entry in fs::read_dir(&real).map_err(|e| FsError::io(&real, e))? {
            let entry = entry.map_err(|e| FsError::io(&real, e))?;
            let kind = entry
                .file_type()
                .map(FileKind::of)
                .map_err(|e| FsError::io(entry.path(), e))?;
            match entry.file_name().into_string() {
                Ok(name) => listing.push((name, kind)),
                Err(name) => tracing::debug!(?name, "skipping non UTF-8 entry"),
            }
        }
        listing.sort_by(|a, b| a.0.cmp(&b.0));

        // Symlinks are renamed only when they point at a regular file.
        let is_file = |name: &str, kind: &FileKind| match kind {
            FileKind::File => true,
            FileKind::Symlink => real.join(name).is_file(),
            _ => false,
        };
        Ok(self
            .translator
            .rewrite_listing(path, listing, is_file)
            .into_iter()
            .map(|(name, kind)| DirEntry { name, kind })
            .collect())
    }

    /// Open `path` for reading and return a handle.
    ///
    /// Compile failures never fail the open; the handle serves error content.
    pub fn open(&self, path: &str, flags: i32) -> Result<u64, FsError> {
        self.log_request("open", path);
        if flags & libc::O_ACCMODE != libc::O_RDONLY || flags & libc::O_TRUNC != 0 {
            return Err(FsError::denied("open", path));
        }

        let (real, metadata) = self.translator.resolve_stat(path)?;
        if metadata.is_dir() {
            return Err(FsError::IsADirectory(path.to_string()));
        }

        let handle = match self.cache.acquire(path, &real, Access::Open) {
            Some(artifact) => OpenFile::Compiled {
                path: path.to_string(),
                real: real.clone(),
                artifact,
            },
            None => OpenFile::Raw {
                path: path.to_string(),
                file: File::open(&real).map_err(|e| FsError::io(&real, e))?,
            },
        };
        self.bridge.watch(path, &real);

        let fh = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.handles.lock().insert(fh, handle);
        tracing::trace!(path, fh, "opened");
        Ok(fh)
    }

    /// Read up to `size` bytes at `offset`. Short reads mean end of file.
    pub fn read(&self, path: &str, fh: u64, offset: u64, size: u32) -> Result<Vec<u8>, FsError> {
        if let Some(pending) = self.cache.artifact(path) {
            return Ok(pending.wait().slice(offset, size).to_vec());
        }

        let source = match self.handles.lock().get(&fh) {
            Some(OpenFile::Compiled { artifact, .. }) => ReadSource::Artifact(Arc::clone(artifact)),
            Some(OpenFile::Raw { file, .. }) => ReadSource::File(
                file.try_clone()
                    .map_err(|e| FsError::io(self.translator.literal(path), e))?,
            ),
            None => return Err(FsError::BadHandle(fh)),
        };

        match source {
            ReadSource::Artifact(artifact) => Ok(artifact.wait().slice(offset, size).to_vec()),
            ReadSource::File(file) => read_at(&file, offset, size)
                .map_err(|e| FsError::io(self.translator.literal(path), e)),
        }
    }

    /// Close handle `fh`.
    ///
    /// A failed cache entry is purged so the next open compiles afresh.
    pub fn release(&self, path: &str, fh: u64) -> Result<(), FsError> {
        self.log_request("release", path);
        let handle = self.handles.lock().remove(&fh).ok_or(FsError::BadHandle(fh))?;
        if handle.path() != path {
            tracing::debug!(path, opened = handle.path(), fh, "release path differs from open");
        }

        if let OpenFile::Compiled { path, real, artifact } = handle {
            if let Some(artifact) = artifact.peek() {
                self.bridge.watch_imports(&path, &real, &artifact.imports);
            }
            self.cache.release(&path);
        }
        Ok(())
    }

    /// Filesystem statistics (fixed placeholders).
    pub fn statfs(&self) -> StatFs {
        StatFs::default()
    }

    // =========================================================================
    // Mutating Handlers
    // =========================================================================

    /// Rejected: the mount is read-only.
    pub fn write(&self, path: &str) -> Result<u32, FsError> {
        Err(FsError::denied("write", path))
    }

    /// Rejected: the mount is read-only.
    pub fn truncate(&self, path: &str) -> Result<(), FsError> {
        Err(FsError::denied("truncate", path))
    }

    /// Rejected: the mount is read-only.
    pub fn unlink(&self, path: &str) -> Result<(), FsError> {
        Err(FsError::denied("unlink", path))
    }

    /// Rejected: the mount is read-only.
    pub fn rename(&self, from: &str, _to: &str) -> Result<(), FsError> {
        Err(FsError::denied("rename", from))
    }

    /// Rejected: the mount is read-only.
    pub fn mkdir(&self, path: &str) -> Result<(), FsError> {
        Err(FsError::denied("mkdir", path))
    }

    /// Rejected: the mount is read-only.
    pub fn rmdir(&self, path: &str) -> Result<(), FsError> {
        Err(FsError::denied("rmdir", path))
    }

    /// Rejected: the mount is read-only.
    pub fn chmod(&self, path: &str) -> Result<(), FsError> {
        Err(FsError::denied("chmod", path))
    }

    /// Rejected: the mount is read-only.
    pub fn create(&self, path: &str) -> Result<u64, FsError> {
        Err(FsError::denied("create", path))
    }

    /// Rejected: extended attributes are not exposed.
    pub fn getxattr(&self, path: &str) -> Result<Vec<u8>, FsError> {
        Err(FsError::denied("getxattr", path))
    }

    /// Rejected: the mount is read-only.
    pub fn setxattr(&self, path: &str) -> Result<(), FsError> {
        Err(FsError::denied("setxattr", path))
    }

    /// Not supported. The transport logs this and answers with the current
    /// attributes instead of an error.
    pub fn chown(&self, path: &str) -> Result<(), FsError> {
        tracing::warn!(path, "chown is not implemented");
        Err(FsError::NotImplemented("chown"))
    }
}

impl Drop for TranspileFs {
    fn drop(&mut self) {
        self.bridge.close();
    }
}

fn read_at(file: &File, offset: u64, size: u32) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; size as usize];
    let mut filled = 0;
    while filled < buf.len() {
        match file.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    buf.truncate(filled);
    Ok(buf)
}
