//! Terminal formatting of compile failures.

use std::path::Path;

use crate::compiler::CompileFailure;

use super::display_path;

/// Output style for [`format_for_terminal`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TerminalStyle {
    /// ANSI colors (only with the `colored-diagnostics` feature).
    #[default]
    Colored,
    /// Plain text.
    Plain,
}

// ============================================================================
// Coloring
// ============================================================================

#[cfg(feature = "colored-diagnostics")]
fn paint_error(text: &str) -> String {
    use owo_colors::OwoColorize;
    text.red().bold().to_string()
}

#[cfg(feature = "colored-diagnostics")]
fn paint_location(text: &str) -> String {
    use owo_colors::OwoColorize;
    text.cyan().to_string()
}

#[cfg(not(feature = "colored-diagnostics"))]
fn paint_error(text: &str) -> String {
    text.to_owned()
}

#[cfg(not(feature = "colored-diagnostics"))]
fn paint_location(text: &str) -> String {
    text.to_owned()
}

/// One-block summary of a failure for stderr.
///
/// ```text
/// error: expected "}".
///   --> /style.scss:1:7
/// ```
pub fn format_for_terminal(failure: &CompileFailure, root: &Path, style: TerminalStyle) -> String {
    let mut location = display_path(&failure.file, root);
    if let Some(line) = failure.line {
        location.push_str(&format!(":{line}"));
        if let Some(column) = failure.column {
            location.push_str(&format!(":{column}"));
        }
    }

    let (label, location) = match style {
        TerminalStyle::Colored => (paint_error("error"), paint_location(&location)),
        TerminalStyle::Plain => ("error".to_owned(), location),
    };

    let mut lines = failure.message.lines();
    let first = lines.next().unwrap_or_default();
    let mut out = format!("{label}: {first}\n  --> {location}\n");
    for line in lines {
        out.push_str("   | ");
        out.push_str(line);
        out.push('\n');
    }
    out
}
