//! Shared colored output utilities for the CLI.
//!
//! Uses `termcolor` for cross-platform colored terminal output, honoring
//! `NO_COLOR` and falling back to auto-detecting whether the stream is a
//! terminal.

use std::io::Write;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

/// Resolves the `ColorChoice` to use for CLI output.
///
/// `NO_COLOR` always wins; otherwise color is auto-detected from whether
/// the stream is a terminal.
pub fn resolve_color_choice() -> ColorChoice {
    if std::env::var_os("NO_COLOR").is_some() {
        ColorChoice::Never
    } else {
        ColorChoice::Auto
    }
}

/// Writes `message` to stderr in bold red, with a trailing newline.
pub fn print_error(message: &str) {
    let mut stderr = StandardStream::stderr(resolve_color_choice());
    let mut spec = ColorSpec::new();
    spec.set_fg(Some(Color::Red)).set_bold(true);
    let _ = stderr.set_color(&spec);
    let _ = writeln!(stderr, "{message}");
    let _ = stderr.reset();
}
