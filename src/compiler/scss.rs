//! SCSS / Sass compilation via `grass`.

use std::io;
use std::path::Path;

use super::{AccessLog, CompileFailure, CompileOptions, Compiled, Compiler};

/// Stylesheet compiler for `.scss` and indented `.sass` sources.
///
/// Output uses the nested layout (closing braces end the last declaration
/// line). Imports are collected by routing grass's file reads through an
/// [`AccessLog`]. Source maps are not produced; `source_map` is ignored.
#[derive(Debug, Clone)]
pub struct ScssCompiler {
    source_ext: &'static str,
}

impl ScssCompiler {
    /// `.scss` → `.css`.
    pub fn scss() -> Self {
        Self { source_ext: ".scss" }
    }

    /// `.sass` → `.css`.
    pub fn sass() -> Self {
        Self { source_ext: ".sass" }
    }
}

impl Compiler for ScssCompiler {
    fn source_ext(&self) -> &str {
        self.source_ext
    }

    fn output_ext(&self) -> &str {
        ".css"
    }

    fn compile(&self, path: &Path, _options: &CompileOptions) -> Result<Compiled, CompileFailure> {
        let fs = RecordingFs::default();
        let options = grass::Options::default()
            .style(grass::OutputStyle::Expanded)
            .fs(&fs);

        match grass::from_path(path, &options) {
            Ok(css) => Ok(Compiled::new(nested(&css)).with_imports(fs.log.dependencies_of(path))),
            Err(err) => Err(failure_from(path, *err).with_imports(fs.log.dependencies_of(path))),
        }
    }
}

/// Fold expanded output into the nested layout: a line holding only `}`
/// joins the line above it.
fn nested(expanded: &str) -> String {
    let mut out = String::with_capacity(expanded.len());
    for line in expanded.lines() {
        if line.trim() == "}" && !out.is_empty() && !out.ends_with("\n\n") {
            out.pop();
            out.push_str(" }\n");
        } else {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

/// Convert a grass error, keeping its location when it has one.
fn failure_from(path: &Path, err: grass::Error) -> CompileFailure {
    let rendered = err.to_string();
    match err.kind() {
        grass::ErrorKind::ParseError { message, loc, .. } => {
            let file = loc.file.name();
            let file = if file.is_empty() { path } else { Path::new(file) };
            CompileFailure::new(file, message).at(loc.begin.line + 1, Some(loc.begin.column + 1))
        }
        _ => CompileFailure::new(path, rendered),
    }
}

/// Filesystem that records every file grass reads.
#[derive(Debug, Default)]
struct RecordingFs {
    log: AccessLog,
}

impl grass::Fs for RecordingFs {
    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.log.record(path);
        std::fs::read(path)
    }
}
