//! Output helpers: JSON-or-text printing plus the stable `[cpm:<command>]`
//! prefix every user-facing error line carries.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;

static JSON_MODE: AtomicBool = AtomicBool::new(false);

pub fn init(json: bool) {
    JSON_MODE.store(json, Ordering::SeqCst);
}

pub fn is_json() -> bool {
    JSON_MODE.load(Ordering::SeqCst)
}

/// Print a serializable payload as pretty JSON.
pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// `[cpm:<command>] message` status line.
pub fn line(command: &str, message: impl AsRef<str>) {
    println!("[cpm:{command}] {}", message.as_ref());
}

/// Error line with at most one remediation hint.
pub fn error_line(command: &str, message: impl AsRef<str>, hint: Option<&str>) {
    eprintln!("[cpm:{command}] {}", message.as_ref());
    if let Some(hint) = hint {
        eprintln!("[cpm:{command}] hint: {hint}");
    }
}
