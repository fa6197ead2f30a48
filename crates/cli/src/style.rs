//! Shared styling utilities for CLI output.

use console::Style;

/// Create a success-styled string (green with checkmark).
pub fn success(msg: &str) -> String {
    let style = Style::new().green();
    format!("{} {}", style.apply_to("✓"), msg)
}

/// Create an error-styled string (red with cross).
pub fn error(msg: &str) -> String {
    let style = Style::new().red();
    format!("{} {}", style.apply_to("✗"), msg)
}

/// Create a warning-styled string (yellow).
pub fn warn(msg: &str) -> String {
    let style = Style::new().yellow();
    format!("{} {}", style.apply_to("⚠"), msg)
}

/// Create a header-styled string (bold, white).
pub fn header(msg: &str) -> String {
    let style = Style::new().bold();
    style.apply_to(msg).to_string()
}

/// Create a dim-styled string.
pub fn dim(msg: &str) -> String {
    let style = Style::new().dim();
    style.apply_to(msg).to_string()
}

/// Label for changes made on our side (green).
pub fn ours() -> String {
    Style::new().green().bold().apply_to("ours").to_string()
}

/// Label for changes made on their side (blue).
pub fn theirs() -> String {
    Style::new().blue().bold().apply_to("theirs").to_string()
}

/// Marker for the checked-out branch.
pub fn current_marker(is_current: bool) -> String {
    if is_current {
        Style::new().green().apply_to("●").to_string()
    } else {
        " ".to_string()
    }
}
