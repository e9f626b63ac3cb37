//! Output functions for consistent CLI formatting

use console::style;

/// Display a title line
pub fn intro(title: &str) {
    println!("{}", style(title).cyan().bold());
    println!();
}

/// Display a success step
pub fn step_ok(message: &str) {
    println!("  {} {}", style("[OK]").green(), message);
}

/// Display a success step with detail
pub fn step_ok_detail(message: &str, detail: &str) {
    println!("  {} {} ({})", style("[OK]").green(), message, style(detail).dim());
}

/// Display a warning step with a hint
pub fn step_warn_hint(message: &str, hint: &str) {
    println!("  {} {}", style("[WARN]").yellow(), message);
    println!("       {}", style(hint).dim());
}

/// Display an info step
pub fn step_info(message: &str) {
    println!("  {} {}", style("[INFO]").cyan(), message);
}

/// Display an aligned key/value line
pub fn key_value(key: &str, value: &str) {
    println!("  {:<32} {}", style(key).dim(), value);
}
