//! `transpile-fs` command: mount a transpiled view of a directory.
//!
//! ```text
//! transpile-fs site/ mnt/ -w '**/*.scss' --compiler '.ts:.js=esbuild {}'
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use transpile_fs::fuse::{prepare_mountpoint, spawn_mount};
use transpile_fs::{
    CommandCompiler, CompilerRegistry, FsEvent, OptionsBuilder, TerminalStyle, TranspileFs,
    format_for_terminal,
};

/// Serve a read-only, transpiled view of a source directory.
#[derive(Debug, Parser)]
#[command(name = "transpile-fs", version)]
struct Args {
    /// Source directory.
    source: PathBuf,

    /// Where to mount the view (created if missing).
    mountpoint: PathBuf,

    /// Diagnostic logging.
    #[arg(short, long)]
    verbose: bool,

    /// Glob pattern of files to watch for changes (repeatable).
    #[arg(short, long = "watch", value_name = "PATTERN")]
    watches: Vec<String>,

    /// Do not emit source-map annotations. External compilers see this as
    /// `TRANSPILE_FS_SOURCE_MAP=0`; the SCSS compiler never emits them.
    #[arg(long)]
    no_source_map: bool,

    /// Browser targets for CSS post-processing (repeatable).
    #[arg(long = "browsers", value_name = "SPEC")]
    browsers: Vec<String>,

    /// External compiler `SRC:OUT=program args`, `{}` is the source path (repeatable).
    #[arg(long = "compiler", value_name = "SPEC")]
    compilers: Vec<CommandCompiler>,

    /// Recompile on change instead of only invalidating.
    #[arg(long)]
    prewarm: bool,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "transpile_fs=debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run(args: Args) -> anyhow::Result<()> {
    let mut builder = OptionsBuilder::new()
        .watches(args.watches)
        .verbose(args.verbose)
        .source_map(!args.no_source_map)
        .prewarm(args.prewarm);
    if !args.browsers.is_empty() {
        builder = builder.browsers(args.browsers);
    }
    let options = builder.build();
    let threads = options.compile_threads;

    let mut registry = CompilerRegistry::builtin();
    for compiler in args.compilers {
        registry = registry.with(compiler);
    }

    let fs = TranspileFs::new(&args.source, &registry, options)
        .with_context(|| format!("cannot serve {}", args.source.display()))?;
    let root = fs.root().to_path_buf();
    fs.subscribe(move |event| {
        if let FsEvent::CompileFailed { failure, .. } = event {
            eprint!("{}", format_for_terminal(failure, &root, TerminalStyle::Colored));
        }
    });

    let created = prepare_mountpoint(&args.mountpoint)?;
    let session = match spawn_mount(Arc::new(fs), &args.mountpoint, threads) {
        Ok(session) => session,
        Err(e) => {
            if created {
                let _ = std::fs::remove_dir(&args.mountpoint);
            }
            return Err(e).context("mount failed");
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    println!(
        "Serving {} at {}. Press Ctrl+C to unmount and exit.",
        args.source.display(),
        session.mountpoint().display()
    );
    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(200));
    }

    session.unmount().context("unmount failed")?;
    if created && let Err(e) = std::fs::remove_dir(&args.mountpoint) {
        tracing::warn!(
            mountpoint = %args.mountpoint.display(),
            error = %e,
            "cannot remove mountpoint"
        );
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
