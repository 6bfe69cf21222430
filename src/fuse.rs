//! `fuser` transport adapter.
//!
//! ```text
//! kernel ──► fuser::Session ──► FuseAdapter (inode ↔ virtual path)
//!                                   │ spawn per request
//!                                   ▼
//!                          rayon pool ──► TranspileFs handlers ──► reply
//! ```
//!
//! The kernel speaks inodes; [`TranspileFs`] speaks virtual paths. The
//! adapter hands out inode numbers on lookup and dispatches every request
//! that may block (stat, compile wait, disk read) to its own pool, so one
//! slow compile never stalls unrelated requests.

use std::ffi::OsStr;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FUSE_ROOT_ID, FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr,
    ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs,
    ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::error::FsError;
use crate::fs::{FileKind, FileStat, TranspileFs};
use crate::translate::join_virtual;

/// Filesystem name shown in the mount table.
pub const FS_NAME: &str = "transpile-fs";

/// Attempts per unmount command while the mount is busy.
const BUSY_RETRIES: u32 = 5;
const BUSY_BACKOFF: Duration = Duration::from_millis(200);

// =============================================================================
// Inode Table
// =============================================================================

struct Node {
    path: String,
    /// Lookups the kernel has not forgotten yet.
    lookups: u64,
}

struct InodeMaps {
    by_path: FxHashMap<String, u64>,
    nodes: FxHashMap<u64, Node>,
    next: u64,
}

/// Inode numbers for virtual paths, held while the kernel references them.
///
/// A number is recorded on lookup and dropped once the kernel forgets every
/// lookup of it. The root is never dropped.
struct InodeTable {
    maps: Mutex<InodeMaps>,
}

impl InodeTable {
    fn new() -> Self {
        let mut maps = InodeMaps {
            by_path: FxHashMap::default(),
            nodes: FxHashMap::default(),
            next: FUSE_ROOT_ID + 1,
        };
        maps.by_path.insert("/".to_string(), FUSE_ROOT_ID);
        maps.nodes.insert(
            FUSE_ROOT_ID,
            Node {
                path: "/".to_string(),
                lookups: 0,
            },
        );
        Self {
            maps: Mutex::new(maps),
        }
    }

    fn path(&self, ino: u64) -> Option<String> {
        self.maps.lock().nodes.get(&ino).map(|node| node.path.clone())
    }

    /// Record one kernel lookup of `path` and return its number.
    fn lookup(&self, path: &str) -> u64 {
        let mut maps = self.maps.lock();
        if let Some(&ino) = maps.by_path.get(path) {
            if let Some(node) = maps.nodes.get_mut(&ino) {
                node.lookups += 1;
            }
            return ino;
        }
        let ino = maps.next;
        maps.next += 1;
        maps.by_path.insert(path.to_string(), ino);
        maps.nodes.insert(
            ino,
            Node {
                path: path.to_string(),
                lookups: 1,
            },
        );
        ino
    }

    /// Number for a listing entry. Paths the kernel never looked up get an
    /// unrecorded fresh number.
    fn listed(&self, path: &str) -> u64 {
        let mut maps = self.maps.lock();
        match maps.by_path.get(path) {
            Some(&ino) => ino,
            None => {
                let ino = maps.next;
                maps.next += 1;
                ino
            }
        }
    }

    /// The kernel dropped `nlookup` references to `ino`.
    fn forget(&self, ino: u64, nlookup: u64) {
        if ino == FUSE_ROOT_ID {
            return;
        }
        let mut maps = self.maps.lock();
        let Some(node) = maps.nodes.get_mut(&ino) else {
            return;
        };
        node.lookups = node.lookups.saturating_sub(nlookup);
        if node.lookups == 0
            && let Some(node) = maps.nodes.remove(&ino)
        {
            maps.by_path.remove(&node.path);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.maps.lock().nodes.len()
    }
}

fn parent_of(path: &str) -> &str {
    match path.trim_end_matches('/').rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

// =============================================================================
// Attribute Conversion
// =============================================================================

fn file_type(kind: FileKind) -> FileType {
    match kind {
        FileKind::File => FileType::RegularFile,
        FileKind::Directory => FileType::Directory,
        FileKind::Symlink => FileType::Symlink,
        FileKind::Other => FileType::NamedPipe,
    }
}

fn to_file_attr(ino: u64, stat: &FileStat) -> FileAttr {
    FileAttr {
        ino,
        size: stat.size,
        blocks: stat.blocks,
        atime: stat.atime,
        mtime: stat.mtime,
        ctime: stat.ctime,
        crtime: UNIX_EPOCH,
        kind: file_type(stat.kind),
        perm: stat.perm,
        nlink: stat.nlink,
        uid: stat.uid,
        gid: stat.gid,
        rdev: stat.rdev,
        blksize: stat.blksize,
        flags: 0,
    }
}

// =============================================================================
// FuseAdapter
// =============================================================================

/// [`Filesystem`] implementation over a [`TranspileFs`].
pub struct FuseAdapter {
    fs: Arc<TranspileFs>,
    inodes: Arc<InodeTable>,
    pool: Arc<rayon::ThreadPool>,
    ttl: Duration,
}

impl FuseAdapter {
    /// Wrap `fs`, dispatching requests on `threads` workers.
    pub fn new(fs: Arc<TranspileFs>, threads: usize) -> Result<Self, FsError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("fuse-{i}"))
            .build()
            .map_err(|e| FsError::Mount(format!("cannot start request pool: {e}")))?;
        let ttl = fs.options().attr_ttl;
        Ok(Self {
            fs,
            inodes: Arc::new(InodeTable::new()),
            pool: Arc::new(pool),
            ttl,
        })
    }

    fn path_or_reply(&self, ino: u64) -> Result<String, i32> {
        self.inodes.path(ino).ok_or(libc::ENOENT)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<String, i32> {
        let parent = self.path_or_reply(parent)?;
        let name = name.to_str().ok_or(libc::ENOENT)?;
        Ok(join_virtual(&parent, name))
    }

    /// Reply with the current attributes of `ino`.
    fn reply_attr(&self, ino: u64, path: String, reply: ReplyAttr) {
        let fs = Arc::clone(&self.fs);
        let ttl = self.ttl;
        self.pool.spawn(move || match fs.getattr(&path) {
            Ok(stat) => reply.attr(&ttl, &to_file_attr(ino, &stat)),
            Err(e) => reply.error(e.errno()),
        });
    }
}

impl Filesystem for FuseAdapter {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
        self.fs.init();
        Ok(())
    }

    fn destroy(&mut self) {
        self.fs.destroy();
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let fs = Arc::clone(&self.fs);
        let inodes = Arc::clone(&self.inodes);
        let ttl = self.ttl;
        self.pool.spawn(move || match fs.getattr(&path) {
            Ok(stat) => {
                let ino = inodes.lookup(&path);
                reply.entry(&ttl, &to_file_attr(ino, &stat), 0);
            }
            Err(e) => reply.error(e.errno()),
        });
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.path_or_reply(ino) {
            Ok(path) => self.reply_attr(ino, path, reply),
            Err(errno) => reply.error(errno),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = match self.path_or_reply(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };

        let denied = if size.is_some() {
            self.fs.truncate(&path).err()
        } else if mode.is_some() {
            self.fs.chmod(&path).err()
        } else if atime.is_some() || mtime.is_some() {
            Some(FsError::denied("utimens", path.as_str()))
        } else {
            None
        };
        if let Some(e) = denied {
            return reply.error(e.errno());
        }

        if (uid.is_some() || gid.is_some())
            && let Err(e) = self.fs.chown(&path)
        {
            tracing::debug!(path, error = %e, "ignoring chown");
        }
        self.reply_attr(ino, path, reply);
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        match self.child_path(parent, name) {
            Ok(path) => reply.error(errno_of(self.fs.mkdir(&path))),
            Err(errno) => reply.error(errno),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.child_path(parent, name) {
            Ok(path) => reply.error(errno_of(self.fs.unlink(&path))),
            Err(errno) => reply.error(errno),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.child_path(parent, name) {
            Ok(path) => reply.error(errno_of(self.fs.rmdir(&path))),
            Err(errno) => reply.error(errno),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let paths = self
            .child_path(parent, name)
            .and_then(|from| Ok((from, self.child_path(newparent, newname)?)));
        match paths {
            Ok((from, to)) => reply.error(errno_of(self.fs.rename(&from, &to))),
            Err(errno) => reply.error(errno),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = match self.path_or_reply(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let fs = Arc::clone(&self.fs);
        self.pool.spawn(move || match fs.open(&path, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.errno()),
        });
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let path = match self.path_or_reply(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let Ok(offset) = u64::try_from(offset) else {
            return reply.error(libc::EINVAL);
        };
        let fs = Arc::clone(&self.fs);
        self.pool.spawn(move || match fs.read(&path, fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.errno()),
        });
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _offset: i64,
        _data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        match self.path_or_reply(ino) {
            Ok(path) => reply.error(errno_of(self.fs.write(&path))),
            Err(errno) => reply.error(errno),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let path = self.inodes.path(ino).unwrap_or_default();
        let fs = Arc::clone(&self.fs);
        self.pool.spawn(move || match fs.release(&path, fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        });
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = match self.path_or_reply(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let fs = Arc::clone(&self.fs);
        let inodes = Arc::clone(&self.inodes);
        self.pool.spawn(move || {
            let listing = match fs.readdir(&path) {
                Ok(listing) => listing,
                Err(e) => return reply.error(e.errno()),
            };

            let parent = inodes.listed(parent_of(&path));
            let mut entries = vec![
                (ino, FileType::Directory, ".".to_string()),
                (parent, FileType::Directory, "..".to_string()),
            ];
            entries.extend(listing.into_iter().map(|entry| {
                let child = inodes.listed(&join_virtual(&path, &entry.name));
                (child, file_type(entry.kind), entry.name)
            }));

            let skip = usize::try_from(offset).unwrap_or(0);
            for (i, (child, kind, name)) in entries.iter().enumerate().skip(skip) {
                if reply.add(*child, (i + 1) as i64, *kind, name) {
                    break;
                }
            }
            reply.ok();
        });
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let s = self.fs.statfs();
        reply.statfs(s.blocks, s.bfree, s.bavail, s.files, s.ffree, s.bsize, s.namelen, s.frsize);
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _name: &OsStr,
        _value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        match self.path_or_reply(ino) {
            Ok(path) => reply.error(errno_of(self.fs.setxattr(&path))),
            Err(errno) => reply.error(errno),
        }
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _name: &OsStr,
        _size: u32,
        reply: ReplyXattr,
    ) {
        match self.path_or_reply(ino) {
            Ok(path) => reply.error(errno_of(self.fs.getxattr(&path))),
            Err(errno) => reply.error(errno),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        match self.child_path(parent, name) {
            Ok(path) => reply.error(errno_of(self.fs.create(&path))),
            Err(errno) => reply.error(errno),
        }
    }
}

/// Errno for a handler that never succeeds.
fn errno_of<T>(result: Result<T, FsError>) -> i32 {
    match result {
        Ok(_) => libc::EIO,
        Err(e) => e.errno(),
    }
}

// =============================================================================
// Mounting
// =============================================================================

fn mount_options() -> Vec<MountOption> {
    vec![
        MountOption::RO,
        MountOption::FSName(FS_NAME.into()),
        MountOption::AutoUnmount,
    ]
}

/// A live background mount. Dropping it unmounts.
pub struct MountSession {
    session: fuser::BackgroundSession,
    mountpoint: PathBuf,
}

impl MountSession {
    /// Where the filesystem is mounted.
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Unmount (retrying while busy, then forcing) and wait for the session
    /// thread to finish.
    ///
    /// The session thread is only joined once the kernel mount is gone; on
    /// failure it is left to end with the process.
    pub fn unmount(self) -> Result<(), FsError> {
        tracing::info!(mountpoint = %self.mountpoint.display(), "unmounting");
        unmount(&self.mountpoint)?;

        let session = self.session;
        panic::catch_unwind(AssertUnwindSafe(move || session.join())).map_err(|_| {
            FsError::Mount(format!("{}: session thread failed", self.mountpoint.display()))
        })
    }
}

/// Mount `fs` at `mountpoint` and serve requests until unmounted.
pub fn mount(fs: Arc<TranspileFs>, mountpoint: &Path, threads: usize) -> Result<(), FsError> {
    clear_stale_mount(mountpoint)?;
    let adapter = FuseAdapter::new(fs, threads)?;
    fuser::mount2(adapter, mountpoint, &mount_options())
        .map_err(|e| FsError::Mount(format!("{}: {e}", mountpoint.display())))
}

/// Mount `fs` at `mountpoint` on a background thread.
pub fn spawn_mount(
    fs: Arc<TranspileFs>,
    mountpoint: &Path,
    threads: usize,
) -> Result<MountSession, FsError> {
    clear_stale_mount(mountpoint)?;
    let adapter = FuseAdapter::new(fs, threads)?;
    let session = fuser::spawn_mount2(adapter, mountpoint, &mount_options())
        .map_err(|e| FsError::Mount(format!("{}: {e}", mountpoint.display())))?;
    tracing::info!(mountpoint = %mountpoint.display(), "mounted");
    Ok(MountSession {
        session,
        mountpoint: mountpoint.to_path_buf(),
    })
}

// =============================================================================
// Unmounting
// =============================================================================

/// Unmount commands in escalation order: plain first, then lazy or forced.
fn unmount_commands(mountpoint: &Path) -> Vec<(&'static str, Vec<String>)> {
    let target = mountpoint.display().to_string();
    if cfg!(target_os = "macos") {
        vec![
            ("umount", vec![target.clone()]),
            ("diskutil", vec!["unmount".into(), target.clone()]),
            ("diskutil", vec!["unmount".into(), "force".into(), target.clone()]),
            ("umount", vec!["-f".into(), target]),
        ]
    } else {
        vec![
            ("fusermount", vec!["-u".into(), target.clone()]),
            ("umount", vec![target.clone()]),
            ("fusermount", vec!["-uz".into(), target.clone()]),
            ("umount", vec!["-l".into(), target]),
        ]
    }
}

/// Unmount whatever is mounted at `mountpoint`, retrying while busy and
/// escalating to lazy or forced unmount.
pub fn unmount(mountpoint: &Path) -> Result<(), FsError> {
    let mut last_error = String::from("no unmount command available");

    for (program, args) in unmount_commands(mountpoint) {
        for attempt in 1..=BUSY_RETRIES {
            let output = match Command::new(program).args(&args).output() {
                Ok(output) => output,
                Err(e) => {
                    last_error = format!("{program}: {e}");
                    break;
                }
            };
            if output.status.success() {
                tracing::info!(mountpoint = %mountpoint.display(), program, ?args, "unmounted");
                return Ok(());
            }

            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            last_error = format!("{program} {}: {stderr}", args.join(" "));
            if !stderr.to_lowercase().contains("busy") {
                break;
            }
            tracing::debug!(
                mountpoint = %mountpoint.display(),
                program,
                attempt,
                "mount busy, retrying"
            );
            thread::sleep(BUSY_BACKOFF);
        }
    }

    Err(FsError::Mount(last_error))
}

/// Whether something other than the parent's filesystem is mounted at
/// `mountpoint`. A disconnected FUSE mount counts as mounted.
pub fn is_mounted(mountpoint: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    let metadata = match std::fs::metadata(mountpoint) {
        Ok(metadata) => metadata,
        Err(e) => return e.raw_os_error() == Some(libc::ENOTCONN),
    };
    let parent = mountpoint.parent().unwrap_or(Path::new("/"));
    match std::fs::metadata(parent) {
        Ok(parent) => parent.dev() != metadata.dev(),
        Err(_) => false,
    }
}

/// Unmount a mount left behind by a previous run.
pub fn clear_stale_mount(mountpoint: &Path) -> Result<(), FsError> {
    if !is_mounted(mountpoint) {
        return Ok(());
    }
    tracing::warn!(mountpoint = %mountpoint.display(), "clearing stale mount");
    unmount(mountpoint)
}

/// Create `mountpoint` if missing. Returns whether it was created.
pub fn prepare_mountpoint(mountpoint: &Path) -> Result<bool, FsError> {
    match std::fs::create_dir(mountpoint) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) if e.raw_os_error() == Some(libc::ENOTCONN) => Ok(false),
        Err(e) => Err(FsError::io(mountpoint, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inode_assignment_is_stable() {
        let table = InodeTable::new();
        assert_eq!(table.path(FUSE_ROOT_ID).as_deref(), Some("/"));

        let a = table.lookup("/a.css");
        let b = table.lookup("/dir/b.css");
        assert_ne!(a, b);
        assert_eq!(table.lookup("/a.css"), a);
        assert_eq!(table.listed("/a.css"), a);
        assert_eq!(table.path(b).as_deref(), Some("/dir/b.css"));
        assert_eq!(table.lookup("/"), FUSE_ROOT_ID);
    }

    #[test]
    fn test_forgotten_inodes_are_dropped() {
        let table = InodeTable::new();
        let a = table.lookup("/a.css");
        table.lookup("/a.css");

        table.forget(a, 1);
        assert_eq!(table.path(a).as_deref(), Some("/a.css"));
        table.forget(a, 1);
        assert!(table.path(a).is_none());
        assert_eq!(table.len(), 1);

        // unlooked-up listing entries leave nothing behind
        let listed = table.listed("/b.css");
        assert!(table.path(listed).is_none());
        assert_ne!(table.lookup("/a.css"), a);

        table.forget(FUSE_ROOT_ID, 10);
        assert_eq!(table.path(FUSE_ROOT_ID).as_deref(), Some("/"));
    }

    #[test]
    fn test_parent_of() {
        assert_eq!(parent_of("/"), "/");
        assert_eq!(parent_of("/a.css"), "/");
        assert_eq!(parent_of("/dir/b.css"), "/dir");
        assert_eq!(parent_of("/x/y/z"), "/x/y");
    }

    #[test]
    fn test_unmount_escalates() {
        let commands = unmount_commands(Path::new("/mnt/x"));
        assert_eq!(commands.len(), 4);
        assert!(commands.last().unwrap().1.iter().any(|a| a.starts_with('-')));
    }

    #[test]
    fn test_unmount_reports_failure() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = unmount(dir.path()).unwrap_err();
        assert!(matches!(err, FsError::Mount(_)));
        assert_ne!(err.errno(), 0);
    }

    #[test]
    fn test_prepare_mountpoint() {
        let dir = tempfile::TempDir::new().unwrap();
        let mnt = dir.path().join("mnt");
        assert!(prepare_mountpoint(&mnt).unwrap());
        assert!(!prepare_mountpoint(&mnt).unwrap());
        assert!(!is_mounted(&mnt));
    }
}
