//! Crossterm-backed terminal manager for the controlling tty.

use std::io::{self, Write};

use crossterm::{
    event::{DisableMouseCapture, EnableMouseCapture},
    execute,
    terminal::{self, EnterAlternateScreen, LeaveAlternateScreen},
};

use crate::ansi;
use crate::error::Result;

use super::TerminalManager;

/// Terminal manager writing to the process's stdout.
///
/// Mode switches (raw mode, alternate screen, mouse capture) go through
/// crossterm; cursor movement, clears, and scroll-region control are
/// emitted as hand-built CSI sequences from [`crate::ansi`].
pub struct TtyTerminal {
    stdout: io::Stdout,
    raw_mode: bool,
}

impl TtyTerminal {
    /// Create a new tty-backed manager. No terminal state is touched
    /// until [`TerminalManager::init`].
    pub fn new() -> Self {
        Self {
            stdout: io::stdout(),
            raw_mode: false,
        }
    }

    fn write_str(&mut self, s: &str) -> Result<()> {
        self.stdout.write_all(s.as_bytes())?;
        Ok(())
    }
}

impl Default for TtyTerminal {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalManager for TtyTerminal {
    fn init(&mut self) -> Result<()> {
        self.stdout.flush()?;
        Ok(())
    }

    fn cleanup(&mut self) -> Result<()> {
        // Run every restoration step; keep the first error.
        let mut first_err: Option<crate::error::CoreError> = None;
        let mut note = |r: Result<()>| {
            if let Err(e) = r {
                tracing::warn!("terminal cleanup step failed: {e}");
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        };

        note(self.reset_scroll_region());
        note(self.show_cursor());
        if self.raw_mode {
            note(self.set_raw_mode(false));
        }
        note(self.flush());

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn size(&self) -> Result<(u16, u16)> {
        let (w, h) = terminal::size()?;
        Ok((w, h))
    }

    fn set_raw_mode(&mut self, enabled: bool) -> Result<()> {
        if enabled == self.raw_mode {
            return Ok(());
        }
        if enabled {
            terminal::enable_raw_mode()?;
        } else {
            terminal::disable_raw_mode()?;
        }
        self.raw_mode = enabled;
        Ok(())
    }

    fn is_raw_mode(&self) -> bool {
        self.raw_mode
    }

    fn move_cursor(&mut self, x: u16, y: u16) -> Result<()> {
        let seq = ansi::move_to(x, y);
        self.write_str(&seq)
    }

    fn save_cursor(&mut self) -> Result<()> {
        self.write_str(ansi::SAVE_CURSOR)
    }

    fn restore_cursor(&mut self) -> Result<()> {
        self.write_str(ansi::RESTORE_CURSOR)
    }

    fn hide_cursor(&mut self) -> Result<()> {
        self.write_str(ansi::HIDE_CURSOR)
    }

    fn show_cursor(&mut self) -> Result<()> {
        self.write_str(ansi::SHOW_CURSOR)
    }

    fn clear_screen(&mut self) -> Result<()> {
        self.write_str(ansi::CLEAR_SCREEN)
    }

    fn clear_line(&mut self) -> Result<()> {
        self.write_str(ansi::CLEAR_LINE)
    }

    fn clear_to_eol(&mut self) -> Result<()> {
        self.write_str(ansi::CLEAR_TO_EOL)
    }

    fn clear_to_sol(&mut self) -> Result<()> {
        self.write_str(ansi::CLEAR_TO_SOL)
    }

    fn clear_to_eos(&mut self) -> Result<()> {
        self.write_str(ansi::CLEAR_TO_EOS)
    }

    fn clear_scrollback(&mut self) -> Result<()> {
        self.write_str(ansi::CLEAR_SCROLLBACK)
    }

    fn set_scroll_region(&mut self, top: u16, bottom: u16) -> Result<()> {
        let seq = ansi::set_scroll_region(top, bottom);
        self.write_str(&seq)
    }

    fn reset_scroll_region(&mut self) -> Result<()> {
        self.write_str(ansi::RESET_SCROLL_REGION)
    }

    fn scroll_up(&mut self, n: u16) -> Result<()> {
        let seq = ansi::scroll_up(n);
        self.write_str(&seq)
    }

    fn scroll_down(&mut self, n: u16) -> Result<()> {
        let seq = ansi::scroll_down(n);
        self.write_str(&seq)
    }

    fn enter_alt_screen(&mut self) -> Result<()> {
        execute!(self.stdout, EnterAlternateScreen)?;
        Ok(())
    }

    fn exit_alt_screen(&mut self) -> Result<()> {
        execute!(self.stdout, LeaveAlternateScreen)?;
        Ok(())
    }

    fn enable_mouse(&mut self) -> Result<()> {
        execute!(self.stdout, EnableMouseCapture)?;
        Ok(())
    }

    fn disable_mouse(&mut self) -> Result<()> {
        execute!(self.stdout, DisableMouseCapture)?;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.stdout.write_all(data)?;
        Ok(())
    }

    fn write_text(&mut self, text: &str) -> Result<()> {
        if self.raw_mode && text.contains('\n') {
            let translated = text.replace('\n', "\r\n");
            self.stdout.write_all(translated.as_bytes())?;
        } else {
            self.stdout.write_all(text.as_bytes())?;
        }
        Ok(())
    }

    fn write_at(&mut self, x: u16, y: u16, data: &[u8]) -> Result<()> {
        self.move_cursor(x, y)?;
        self.write(data)
    }

    fn flush(&mut self) -> Result<()> {
        self.stdout.flush()?;
        Ok(())
    }
}

impl Drop for TtyTerminal {
    fn drop(&mut self) {
        if self.raw_mode {
            let _ = terminal::disable_raw_mode();
            let _ = self.stdout.write_all(ansi::SHOW_CURSOR.as_bytes());
            let _ = self.stdout.flush();
        }
    }
}
