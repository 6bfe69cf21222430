//! Error content rendering.
//!
//! A failed compile still has to produce a file of the expected media type:
//! a browser loading `style.css` or `app.js` gets content it can parse, which
//! shows the error on the page instead of silently breaking it.
//!
//! ```text
//! CompileFailure ──► error_message() ──► render_failure(target_ext)
//!                                          ├─► .css   body::before banner
//!                                          ├─► .js    IIFE appending a DIV
//!                                          ├─► .html  <pre> page
//!                                          └─► other  plain text
//! ```

mod terminal;

use std::path::Path;

pub use terminal::{TerminalStyle, format_for_terminal};

use crate::compiler::CompileFailure;

/// Prefix of every rendered error message.
pub const ERROR_PREFIX: &str = "Transpiler error: ";

// ============================================================================
// Message
// ============================================================================

/// Format `Transpiler error: <file>:<line>[:<column>]\n<message>`.
///
/// `file` is shown relative to `root` (with a leading `/`) when it lies
/// inside it.
pub fn error_message(failure: &CompileFailure, root: &Path) -> String {
    let mut out = String::from(ERROR_PREFIX);
    out.push_str(&display_path(&failure.file, root));
    if let Some(line) = failure.line {
        out.push_str(&format!(":{line}"));
        if let Some(column) = failure.column {
            out.push_str(&format!(":{column}"));
        }
    }
    out.push('\n');
    out.push_str(&failure.message);
    out
}

/// Path as seen from the mount root.
pub fn display_path(path: &Path, root: &Path) -> String {
    match path.strip_prefix(root) {
        Ok(rel) => format!("/{}", rel.display()),
        Err(_) => path.display().to_string(),
    }
}

// ============================================================================
// Rendering
// ============================================================================

/// Render a failure as content of the `target_ext` media type.
pub fn render_failure(target_ext: &str, failure: &CompileFailure, root: &Path) -> Vec<u8> {
    render_message(target_ext, &error_message(failure, root))
}

/// Render an already formatted message for `target_ext`.
pub fn render_message(target_ext: &str, message: &str) -> Vec<u8> {
    match target_ext {
        ".css" => css(message),
        ".js" | ".mjs" => js(message),
        ".html" | ".htm" => html(message),
        _ => message.to_owned(),
    }
    .into_bytes()
}

fn css(message: &str) -> String {
    format!(
        "/* {comment} */\n\
         html body > * {{\n  display: none !important;\n}}\n\
         html body::before {{\n\
         \x20 content: \"{content}\";\n\
         \x20 display: block;\n\
         \x20 position: fixed;\n\
         \x20 top: 0;\n\
         \x20 left: 0;\n\
         \x20 right: 0;\n\
         \x20 z-index: 2147483647;\n\
         \x20 margin: 10px;\n\
         \x20 padding: 10px;\n\
         \x20 border: 4px dashed red;\n\
         \x20 background: white;\n\
         \x20 color: black;\n\
         \x20 font: 16px/1.4 monospace;\n\
         \x20 text-align: left;\n\
         \x20 white-space: pre-wrap;\n\
         }}\n",
        comment = message.replace("*/", "* /"),
        content = css_string(message),
    )
}

fn js(message: &str) -> String {
    let comment: String = message
        .replace("*/", "* /")
        .lines()
        .map(|line| format!(" * {line}\n"))
        .collect();
    format!(
        "/*\n{comment} */\n\
         ;(function () {{\n\
         \x20   var element = document.createElement(\"DIV\");\n\
         \x20   element.style.position = \"fixed\";\n\
         \x20   element.style.top = 0;\n\
         \x20   element.style.left = 0;\n\
         \x20   element.style.right = 0;\n\
         \x20   element.style.zIndex = 2147483647;\n\
         \x20   element.style.margin = \"10px\";\n\
         \x20   element.style.padding = \"10px\";\n\
         \x20   element.style.border = \"4px dashed red\";\n\
         \x20   element.style.backgroundColor = \"white\";\n\
         \x20   element.style.color = \"black\";\n\
         \x20   element.style.fontFamily = \"monospace\";\n\
         \x20   element.style.fontSize = \"16px\";\n\
         \x20   element.style.textAlign = \"left\";\n\
         \x20   element.style.whiteSpace = \"pre-wrap\";\n\
         \x20   element.textContent = {literal};\n\
         \x20   (document.body || document.documentElement).appendChild(element);\n\
         }}());\n",
        literal = js_string(message),
    )
}

fn html(message: &str) -> String {
    format!(
        "<!DOCTYPE html>\n\
         <html>\n<head><meta charset=\"utf-8\"><title>Transpiler error</title></head>\n\
         <body>\n\
         <pre style=\"margin: 10px; padding: 10px; border: 4px dashed red; \
         background: white; color: black; white-space: pre-wrap;\">{}</pre>\n\
         </body>\n</html>\n",
        html_escape(message)
    )
}

/// Body of a double-quoted CSS string.
fn css_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\A "),
            c if c.is_control() => out.push_str(&format!("\\{:X} ", c as u32)),
            c => out.push(c),
        }
    }
    out
}

/// A JS string literal, quotes included.
fn js_string(s: &str) -> String {
    serde_json::Value::String(s.to_owned())
        .to_string()
        .replace('\u{2028}', "\\u2028")
        .replace('\u{2029}', "\\u2029")
}

fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}
