//! Shared styling utilities for terminal output.

use console::Style;

use dirmirror_core::instruction::ChangeType;

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

/// Colored display name of a change type: copies towards the backup in
/// green, towards the source in blue, removals in red.
pub fn change_label(change_type: ChangeType) -> String {
    let style = if change_type.is_removal() {
        Style::new().red()
    } else if change_type.is_backward() {
        Style::new().blue()
    } else {
        Style::new().green()
    };
    style.apply_to(change_type.display_name()).to_string()
}
