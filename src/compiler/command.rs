//! Compilers backed by external programs.

use std::path::Path;
use std::process::Command;
use std::str::FromStr;

use thiserror::Error;

use super::{CompileFailure, CompileOptions, Compiled, Compiler, normalize_ext};

/// Placeholder replaced by the source path in command arguments.
const PATH_PLACEHOLDER: &str = "{}";

/// `1` when source-map annotations are wanted, else `0`.
pub const SOURCE_MAP_ENV: &str = "TRANSPILE_FS_SOURCE_MAP";
/// Comma-separated browser targets.
pub const BROWSERS_ENV: &str = "TRANSPILE_FS_BROWSERS";

/// Error parsing a `SRC:OUT=program args` compiler spec.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandSpecError {
    /// Missing `=` between extensions and command.
    #[error("expected SRC:OUT=COMMAND, got {0:?}")]
    Malformed(String),
    /// Empty extension or command.
    #[error("empty {0} in compiler spec")]
    Empty(&'static str),
}

/// Runs an external program; stdout is the output, stderr the failure message.
///
/// Arguments equal to `{}` are replaced with the source path; if none is
/// present the path is appended. [`CompileOptions`] reach the program through
/// the [`SOURCE_MAP_ENV`] and [`BROWSERS_ENV`] environment variables.
#[derive(Debug, Clone)]
pub struct CommandCompiler {
    source_ext: String,
    output_ext: String,
    program: String,
    args: Vec<String>,
}

impl CommandCompiler {
    /// Create a command compiler.
    pub fn new(
        source_ext: &str,
        output_ext: &str,
        program: impl Into<String>,
        args: Vec<String>,
    ) -> Self {
        Self {
            source_ext: normalize_ext(source_ext),
            output_ext: normalize_ext(output_ext),
            program: program.into(),
            args,
        }
    }

    fn command_for(&self, path: &Path, options: &CompileOptions) -> Command {
        let mut command = Command::new(&self.program);
        command
            .env(SOURCE_MAP_ENV, if options.source_map { "1" } else { "0" })
            .env(BROWSERS_ENV, options.browsers.join(","));
        let mut substituted = false;
        for arg in &self.args {
            if arg == PATH_PLACEHOLDER {
                command.arg(path);
                substituted = true;
            } else {
                command.arg(arg);
            }
        }
        if !substituted {
            command.arg(path);
        }
        if let Some(dir) = path.parent() {
            command.current_dir(dir);
        }
        command
    }
}

impl FromStr for CommandCompiler {
    type Err = CommandSpecError;

    /// Parse `.less:.css=lessc {}`.
    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let (exts, cmdline) = spec
            .split_once('=')
            .ok_or_else(|| CommandSpecError::Malformed(spec.to_string()))?;
        let (source, output) = exts
            .split_once(':')
            .ok_or_else(|| CommandSpecError::Malformed(spec.to_string()))?;
        let (source, output) = (source.trim(), output.trim());
        if source.is_empty() || source == "." || output.is_empty() || output == "." {
            return Err(CommandSpecError::Empty("extension"));
        }

        let mut words = cmdline.split_whitespace().map(str::to_string);
        let program = words.next().ok_or(CommandSpecError::Empty("command"))?;
        Ok(Self::new(source, output, program, words.collect()))
    }
}

impl Compiler for CommandCompiler {
    fn source_ext(&self) -> &str {
        &self.source_ext
    }

    fn output_ext(&self) -> &str {
        &self.output_ext
    }

    fn compile(&self, path: &Path, options: &CompileOptions) -> Result<Compiled, CompileFailure> {
        let output = self
            .command_for(path, options)
            .output()
            .map_err(|e| CompileFailure::new(path, format!("{}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                format!("{} exited with {}", self.program, output.status)
            } else {
                stderr
            };
            return Err(CompileFailure::new(path, message));
        }

        Ok(Compiled::new(String::from_utf8_lossy(&output.stdout).into_owned()))
    }
}
