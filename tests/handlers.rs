//! End-to-end handler scenarios, driving `TranspileFs` without a kernel mount.

use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tempfile::TempDir;
use transpile_fs::prelude::*;
use transpile_fs::{CommandCompiler, FileKind};

/// Records every event the mount emits.
#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<FsEvent>>>);

impl Recorder {
    fn attach(fs: &TranspileFs) -> Self {
        let recorder = Self::default();
        let sink = recorder.clone();
        fs.subscribe(move |event| sink.0.lock().push(event.clone()));
        recorder
    }

    fn count(&self, pred: impl Fn(&FsEvent) -> bool) -> usize {
        self.0.lock().iter().filter(|e| pred(e)).count()
    }

    fn misses(&self) -> usize {
        self.count(|e| matches!(e, FsEvent::CacheMiss { .. }))
    }

    fn hits(&self) -> usize {
        self.count(|e| matches!(e, FsEvent::CacheHit { .. }))
    }

    fn failures(&self) -> usize {
        self.count(|e| matches!(e, FsEvent::CompileFailed { .. }))
    }

    fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

/// Lowercases `.up` files into `.low`; counts invocations.
struct Lower {
    calls: Arc<AtomicUsize>,
    delay: Duration,
}

impl Compiler for Lower {
    fn source_ext(&self) -> &str {
        ".up"
    }

    fn output_ext(&self) -> &str {
        ".low"
    }

    fn compile(&self, path: &Path, _: &CompileOptions) -> Result<Compiled, CompileFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.delay);
        let text = fs::read_to_string(path).map_err(|e| CompileFailure::new(path, e.to_string()))?;
        Ok(Compiled::new(text.to_lowercase()))
    }
}

fn mount(dir: &TempDir, registry: &CompilerRegistry) -> TranspileFs {
    TranspileFs::new(dir.path(), registry, MountOptions::default()).unwrap()
}

/// Move `path`'s mtime past every compile started so far.
fn touch(path: &Path) {
    thread::sleep(Duration::from_millis(20));
    File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(SystemTime::now())
        .unwrap();
}

fn backdate(path: &Path) {
    File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(SystemTime::now() - Duration::from_secs(60))
        .unwrap();
}

fn read_all(fs: &TranspileFs, path: &str) -> String {
    let fh = fs.open(path, libc::O_RDONLY).unwrap();
    let data = fs.read(path, fh, 0, 1 << 20).unwrap();
    fs.release(path, fh).unwrap();
    String::from_utf8(data).unwrap()
}

// =============================================================================
// Pass-through
// =============================================================================

#[test]
fn test_passthrough_file_is_untouched() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("unchanged.txt"), "I am the same\n").unwrap();
    let fs = mount(&dir, &CompilerRegistry::builtin());
    let events = Recorder::attach(&fs);

    assert_eq!(fs.getattr("/unchanged.txt").unwrap().size, 14);
    assert_eq!(read_all(&fs, "/unchanged.txt"), "I am the same\n");
    assert!(events.is_empty());
    assert!(fs.cache().is_empty());
}

#[test]
fn test_missing_file_is_not_found() {
    let dir = TempDir::new().unwrap();
    let fs = mount(&dir, &CompilerRegistry::builtin());

    assert_eq!(fs.getattr("/nope.css").unwrap_err().errno(), libc::ENOENT);
    assert_eq!(fs.open("/nope.txt", libc::O_RDONLY).unwrap_err().errno(), libc::ENOENT);
}

// =============================================================================
// Compilation and caching
// =============================================================================

#[test]
fn test_listing_and_reads_use_target_names() {
    let dir = TempDir::new().unwrap();
    fs::create_dir(dir.path().join("sub")).unwrap();
    fs::write(dir.path().join("sub/page.up"), "HELLO").unwrap();
    fs::write(dir.path().join("sub/readme.md"), "# hi").unwrap();
    let registry = CompilerRegistry::new().with(Lower {
        calls: Arc::new(AtomicUsize::new(0)),
        delay: Duration::ZERO,
    });
    let fs = mount(&dir, &registry);

    let names: Vec<_> = fs.readdir("/sub").unwrap().into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["page.low", "readme.md"]);

    let stat = fs.getattr("/sub/page.low").unwrap();
    assert_eq!(stat.size, 5);
    assert_eq!(read_all(&fs, "/sub/page.low"), "hello");
    assert_eq!(read_all(&fs, "/sub/page.up"), "HELLO");
}

#[test]
fn test_directory_named_like_source_passes_through() {
    let dir = TempDir::new().unwrap();
    fs::create_dir(dir.path().join("theme.up")).unwrap();
    fs::write(dir.path().join("theme.up/inner.txt"), "inside").unwrap();
    let registry = CompilerRegistry::new().with(Lower {
        calls: Arc::new(AtomicUsize::new(0)),
        delay: Duration::ZERO,
    });
    let fs = mount(&dir, &registry);

    let entries = fs.readdir("/").unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "theme.up");
    assert_eq!(entries[0].kind, FileKind::Directory);

    assert_eq!(fs.getattr("/theme.low").unwrap_err().errno(), libc::ENOENT);
    assert_eq!(fs.getattr("/theme.up").unwrap().kind, FileKind::Directory);
    assert_eq!(read_all(&fs, "/theme.up/inner.txt"), "inside");
}

#[test]
fn test_second_open_is_cache_hit() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("a.up");
    fs::write(&src, "ABC").unwrap();
    backdate(&src);
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = CompilerRegistry::new().with(Lower {
        calls: Arc::clone(&calls),
        delay: Duration::ZERO,
    });
    let fs = mount(&dir, &registry);
    let events = Recorder::attach(&fs);

    let first = read_all(&fs, "/a.low");
    let second = read_all(&fs, "/a.low");
    assert_eq!(first, "abc");
    assert_eq!(first, second);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(events.misses(), 1);
    assert_eq!(events.hits(), 1);
}

#[test]
fn test_touching_source_recompiles() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("a.up");
    let other = dir.path().join("other.md");
    fs::write(&src, "ABC").unwrap();
    fs::write(&other, "").unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = CompilerRegistry::new().with(Lower {
        calls: Arc::clone(&calls),
        delay: Duration::ZERO,
    });
    let fs = mount(&dir, &registry);

    read_all(&fs, "/a.low");
    touch(&other);
    read_all(&fs, "/a.low");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // same bytes, newer mtime
    touch(&src);
    read_all(&fs, "/a.low");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_concurrent_opens_compile_once() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("slow.up"), "SLOW").unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = CompilerRegistry::new().with(Lower {
        calls: Arc::clone(&calls),
        delay: Duration::from_millis(100),
    });
    let fs = Arc::new(mount(&dir, &registry));

    let readers: Vec<_> = (0..8)
        .map(|_| {
            let fs = Arc::clone(&fs);
            thread::spawn(move || {
                let fh = fs.open("/slow.low", libc::O_RDONLY).unwrap();
                let data = fs.read("/slow.low", fh, 0, 64).unwrap();
                fs.release("/slow.low", fh).unwrap();
                data
            })
        })
        .collect();

    for reader in readers {
        assert_eq!(reader.join().unwrap(), b"slow");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_reads_are_clamped() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("a.up"), "ABCDEF").unwrap();
    let registry = CompilerRegistry::new().with(Lower {
        calls: Arc::new(AtomicUsize::new(0)),
        delay: Duration::ZERO,
    });
    let fs = mount(&dir, &registry);

    let fh = fs.open("/a.low", libc::O_RDONLY).unwrap();
    assert_eq!(fs.read("/a.low", fh, 4, 100).unwrap(), b"ef");
    assert_eq!(fs.read("/a.low", fh, 6, 100).unwrap(), b"");
    assert_eq!(fs.read("/a.low", fh, 1 << 40, 100).unwrap(), b"");
    fs.release("/a.low", fh).unwrap();
}

#[test]
fn test_javascript_target_error_is_script() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("app.src"), "").unwrap();
    let script = "echo nope >&2; exit 1".to_string();
    let failing = CommandCompiler::new(".src", ".js", "sh", vec!["-c".into(), script]);
    let registry = CompilerRegistry::new().with(failing);
    let fs = mount(&dir, &registry);

    let js = read_all(&fs, "/app.js");
    assert!(js.contains("document.createElement"));
    assert!(js.contains("Transpiler error: /app.src"));
}

// =============================================================================
// Stylesheets
// =============================================================================

#[cfg(feature = "scss")]
mod scss {
    use super::*;

    #[test]
    fn test_scss_compiles_and_reports_errors() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("style.scss");
        fs::write(&src, "body { color: red; }").unwrap();
        let fs = mount(&dir, &CompilerRegistry::builtin());
        let events = Recorder::attach(&fs);

        let names: Vec<_> = fs.readdir("/").unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["style.css"]);

        let css = read_all(&fs, "/style.css");
        assert_eq!(css, "body {\n  color: red; }\n");
        assert_eq!(fs.getattr("/style.css").unwrap().size, css.len() as u64);

        fs::write(&src, "body {").unwrap();
        touch(&src);

        let stat = fs.getattr("/style.css").unwrap();
        let fh = fs.open("/style.css", libc::O_RDONLY).unwrap();
        let error = String::from_utf8(fs.read("/style.css", fh, 0, 1 << 20).unwrap()).unwrap();
        assert_eq!(stat.size, error.len() as u64);
        assert!(error.contains("Transpiler error: /style.scss:1"));
        assert!(error.contains("body::before"));
        assert_eq!(events.failures(), 1);

        // the failed entry goes away with its handle
        fs.release("/style.css", fh).unwrap();
        assert!(!fs.cache().contains("/style.css"));

        fs::write(&src, "a { b: c; }").unwrap();
        assert_eq!(read_all(&fs, "/style.css"), "a {\n  b: c; }\n");
        assert!(fs.cache().contains("/style.css"));
    }

    #[test]
    fn test_partial_change_recompiles() {
        let dir = TempDir::new().unwrap();
        let partial = dir.path().join("_colors.scss");
        let unrelated = dir.path().join("_unused.scss");
        fs::write(&partial, "$main: blue;").unwrap();
        fs::write(&unrelated, "$x: 1;").unwrap();
        fs::write(dir.path().join("site.scss"), "@import 'colors';\na { color: $main; }").unwrap();
        let fs = mount(&dir, &CompilerRegistry::builtin());
        let events = Recorder::attach(&fs);

        assert!(read_all(&fs, "/site.css").contains("blue"));
        touch(&unrelated);
        read_all(&fs, "/site.css");
        assert_eq!(events.misses(), 1);

        fs::write(&partial, "$main: green;").unwrap();
        touch(&partial);
        assert!(read_all(&fs, "/site.css").contains("green"));
        assert_eq!(events.misses(), 2);
    }
}

// =============================================================================
// Read-only surface
// =============================================================================

#[test]
fn test_mutations_are_denied() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("keep.txt"), "x").unwrap();
    let fs = mount(&dir, &CompilerRegistry::builtin());

    let results = [
        fs.write("/keep.txt").map(drop),
        fs.truncate("/keep.txt"),
        fs.unlink("/keep.txt"),
        fs.rename("/keep.txt", "/moved.txt"),
        fs.mkdir("/new"),
        fs.rmdir("/"),
        fs.chmod("/keep.txt"),
        fs.create("/new.txt").map(drop),
        fs.setxattr("/keep.txt"),
        fs.getxattr("/keep.txt").map(drop),
    ];
    for result in results {
        assert_eq!(result.unwrap_err().errno(), libc::EPERM);
    }
    assert_eq!(fs.open("/keep.txt", libc::O_WRONLY).unwrap_err().errno(), libc::EPERM);
    assert_eq!(fs.chown("/keep.txt").unwrap_err().errno(), libc::ENOSYS);

    assert_eq!(fs::read_to_string(dir.path().join("keep.txt")).unwrap(), "x");
    assert!(!dir.path().join("moved.txt").exists());
    assert!(!dir.path().join("new").exists());
    assert_eq!(fs.getattr("/keep.txt").unwrap().perm & 0o222, 0);
}
