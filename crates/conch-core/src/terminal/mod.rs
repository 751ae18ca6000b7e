//! Terminal manager trait and backends.
//!
//! The manager is the only place bytes reach the controlling terminal.
//! Higher layers (the controller, components) never touch stdout directly.

mod tty;

pub use test::{TestTerminal, TestTerminalHandle, TermCall};
pub use tty::TtyTerminal;

use crate::error::Result;

/// Narrow facade over the controlling terminal.
///
/// Every operation returns an error sum type; callers treat failures as
/// non-fatal except during [`cleanup`](TerminalManager::cleanup), which
/// best-effort continues the remaining restoration steps.
pub trait TerminalManager: Send {
    /// Prepare the terminal for use (capability probe, initial flush).
    fn init(&mut self) -> Result<()>;

    /// Best-effort restoration: scroll region, cursor visibility, raw mode.
    ///
    /// Runs every step even when earlier ones fail and returns the first
    /// error encountered.
    fn cleanup(&mut self) -> Result<()>;

    /// Current terminal size as `(width, height)` in cells.
    fn size(&self) -> Result<(u16, u16)>;

    /// Enable or disable raw mode.
    fn set_raw_mode(&mut self, enabled: bool) -> Result<()>;

    /// Whether raw mode is currently enabled.
    fn is_raw_mode(&self) -> bool;

    /// Move the cursor to `(x, y)`, 0-based.
    fn move_cursor(&mut self, x: u16, y: u16) -> Result<()>;

    /// Save the cursor position.
    fn save_cursor(&mut self) -> Result<()>;

    /// Restore the saved cursor position.
    fn restore_cursor(&mut self) -> Result<()>;

    /// Hide the cursor.
    fn hide_cursor(&mut self) -> Result<()>;

    /// Show the cursor.
    fn show_cursor(&mut self) -> Result<()>;

    /// Clear the entire screen.
    fn clear_screen(&mut self) -> Result<()>;

    /// Clear the entire current line.
    fn clear_line(&mut self) -> Result<()>;

    /// Clear from the cursor to the end of the line.
    fn clear_to_eol(&mut self) -> Result<()>;

    /// Clear from the cursor to the start of the line.
    fn clear_to_sol(&mut self) -> Result<()>;

    /// Clear from the cursor to the end of the screen.
    fn clear_to_eos(&mut self) -> Result<()>;

    /// Clear the scrollback buffer.
    fn clear_scrollback(&mut self) -> Result<()>;

    /// Restrict scrolling to rows `top..=bottom`, 1-based.
    fn set_scroll_region(&mut self, top: u16, bottom: u16) -> Result<()>;

    /// Reset the scroll region to the whole screen.
    fn reset_scroll_region(&mut self) -> Result<()>;

    /// Scroll the region up by `n` lines.
    fn scroll_up(&mut self, n: u16) -> Result<()>;

    /// Scroll the region down by `n` lines.
    fn scroll_down(&mut self, n: u16) -> Result<()>;

    /// Switch to the alternate screen buffer.
    fn enter_alt_screen(&mut self) -> Result<()>;

    /// Return to the primary screen buffer.
    fn exit_alt_screen(&mut self) -> Result<()>;

    /// Enable mouse reporting.
    fn enable_mouse(&mut self) -> Result<()>;

    /// Disable mouse reporting.
    fn disable_mouse(&mut self) -> Result<()>;

    /// Write raw bytes without translation.
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Write text, translating `\n` to `\r\n` while raw mode is active.
    fn write_text(&mut self, text: &str) -> Result<()>;

    /// Move the cursor to `(x, y)` and write raw bytes there.
    fn write_at(&mut self, x: u16, y: u16, data: &[u8]) -> Result<()>;

    /// Flush buffered output to the terminal.
    fn flush(&mut self) -> Result<()>;
}
