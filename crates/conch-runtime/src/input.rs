//! Multi-line line editor over raw-mode stdin.
//!
//! Reads one logical line (which may contain embedded newlines via
//! paste) with cursor editing, history recall, vertical navigation, and
//! burst-based paste detection. All terminal writes go through the
//! controller's immediate surface so the edit repaint is never
//! interleaved with queued component renders.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use conch_core::ansi;
use conch_core::escape::{EscapeParser, InputEvent};

use std::sync::Arc;

use crate::controller::TerminalController;
use crate::error::{Result, RuntimeError};
use crate::platform;

/// Maximum history entries retained.
pub const HISTORY_CAP: usize = 100;

/// Minimum fast-arriving run length that can start a paste.
const PASTE_MIN_BURST: usize = 12;
/// Run length at which a burst is a paste regardless of timing.
const PASTE_SURE_BURST: usize = 20;
/// Maximum inter-byte gap inside a burst.
const PASTE_BURST_GAP: Duration = Duration::from_millis(30);
/// Silence that finalizes an active paste.
const PASTE_SILENCE: Duration = Duration::from_millis(100);
/// Retry delay when stdin has no data available.
const READ_RETRY_DELAY: Duration = Duration::from_millis(10);
/// Read chunk size for the stdin pump.
const STDIN_CHUNK: usize = 1024;

/// Spawn a blocking pump forwarding stdin bytes in chunks.
///
/// "No data available" read errors sleep ~10 ms and retry; any other
/// error (or EOF) closes the channel.
pub fn stdin_byte_stream() -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel::<Vec<u8>>(64);
    tokio::task::spawn_blocking(move || {
        use std::io::Read;
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; STDIN_CHUNK];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(READ_RETRY_DELAY);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::warn!("stdin read failed: {e}");
                    break;
                }
            }
        }
    });
    rx
}

/// Outcome of processing one input chunk.
#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Continue,
    Submit(String),
    Interrupted,
    SuspendRequested,
}

#[derive(Debug, Default)]
struct PasteState {
    active: bool,
    buf: String,
}

/// Line editor over a raw byte stream and the terminal controller.
pub struct InputReader {
    controller: Arc<TerminalController>,
    rx: mpsc::Receiver<Vec<u8>>,
    parser: EscapeParser,
    prompt: String,

    line: String,
    cursor: usize,
    has_edited: bool,

    history: Vec<String>,
    history_index: isize,

    last_width: usize,
    last_cursor_row: usize,

    burst: Vec<u8>,
    last_byte_at: Option<Instant>,
    paste: PasteState,
}

impl InputReader {
    /// Create a reader consuming byte chunks from `rx`.
    pub fn new(controller: Arc<TerminalController>, rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            controller,
            rx,
            parser: EscapeParser::new(),
            prompt: "> ".to_string(),
            line: String::new(),
            cursor: 0,
            has_edited: false,
            history: Vec::new(),
            history_index: -1,
            last_width: 0,
            last_cursor_row: 0,
            burst: Vec::new(),
            last_byte_at: None,
            paste: PasteState::default(),
        }
    }

    /// Builder-style prompt override.
    #[must_use]
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    /// Replace the history, keeping at most the newest 100 entries.
    pub fn set_history(&mut self, entries: Vec<String>) {
        let skip = entries.len().saturating_sub(HISTORY_CAP);
        self.history = entries.into_iter().skip(skip).collect();
        self.history_index = -1;
    }

    /// Snapshot of the history, oldest first.
    pub fn get_history(&self) -> Vec<String> {
        self.history.clone()
    }

    /// Append an entry, removing earlier duplicates; oldest entries are
    /// discarded past the cap.
    pub fn add_to_history(&mut self, text: impl Into<String>) {
        let text = text.into();
        if text.is_empty() {
            return;
        }
        self.history.retain(|entry| *entry != text);
        self.history.push(text);
        while self.history.len() > HISTORY_CAP {
            self.history.remove(0);
        }
    }

    /// Read one logical line, holding raw mode for the duration.
    ///
    /// Returns [`RuntimeError::Interrupted`] on Ctrl+C.
    pub async fn read_line(&mut self) -> Result<String> {
        let mut guard = self.controller.acquire_raw_mode("read_line")?;
        self.reset_edit_state();
        self.paint_initial()?;

        let result = self.read_loop().await;
        guard.release();
        result
    }

    async fn read_loop(&mut self) -> Result<String> {
        loop {
            let chunk = if self.paste.active {
                match tokio::time::timeout(PASTE_SILENCE, self.rx.recv()).await {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => return Err(RuntimeError::Closed("input stream ended".into())),
                    Err(_) => {
                        self.finalize_paste()?;
                        continue;
                    }
                }
            } else if !self.burst.is_empty() {
                match tokio::time::timeout(PASTE_BURST_GAP, self.rx.recv()).await {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => return Err(RuntimeError::Closed("input stream ended".into())),
                    Err(_) => {
                        // Burst went quiet below the paste threshold: it
                        // was ordinary typing.
                        match self.flush_burst_as_typed()? {
                            Outcome::Continue => continue,
                            outcome => {
                                if let Some(r) = self.resolve(outcome).await? {
                                    return Ok(r);
                                }
                                continue;
                            }
                        }
                    }
                }
            } else {
                match self.rx.recv().await {
                    Some(chunk) => chunk,
                    None => return Err(RuntimeError::Closed("input stream ended".into())),
                }
            };

            let outcome = self.process_chunk(&chunk)?;
            if let Some(r) = self.resolve(outcome).await? {
                return Ok(r);
            }
        }
    }

    /// Map an outcome to a return value, handling suspension inline.
    async fn resolve(&mut self, outcome: Outcome) -> Result<Option<String>> {
        match outcome {
            Outcome::Continue => Ok(None),
            Outcome::Submit(line) => Ok(Some(line)),
            Outcome::Interrupted => Err(RuntimeError::Interrupted),
            Outcome::SuspendRequested => {
                self.suspend_and_resume()?;
                Ok(None)
            }
        }
    }

    // --- chunk processing ---

    fn process_chunk(&mut self, chunk: &[u8]) -> Result<Outcome> {
        let now = Instant::now();
        let gap_ok = self
            .last_byte_at
            .is_none_or(|t| now.duration_since(t) < PASTE_BURST_GAP);
        self.last_byte_at = Some(now);

        if self.paste.active {
            return self.accumulate_paste(chunk, true);
        }

        if !gap_ok && !self.burst.is_empty() {
            let outcome = self.flush_burst_as_typed()?;
            if outcome != Outcome::Continue {
                return Ok(outcome);
            }
        }

        for (i, &byte) in chunk.iter().enumerate() {
            if is_paste_byte(byte) {
                self.burst.push(byte);
                if self.burst.len() >= PASTE_SURE_BURST
                    || (self.burst.len() >= PASTE_MIN_BURST && gap_ok)
                {
                    self.start_paste();
                    // Remaining bytes accumulate under paste rules; a
                    // trailing CR here is part of the burst, not a
                    // lone Enter.
                    return self.accumulate_paste(&chunk[i + 1..], false);
                }
            } else {
                let outcome = self.flush_burst_as_typed()?;
                if outcome != Outcome::Continue {
                    return Ok(outcome);
                }
                let outcome = self.process_byte(byte)?;
                if outcome != Outcome::Continue {
                    return Ok(outcome);
                }
            }
        }

        // Bursts shorter than the threshold stay pending until the
        // 30 ms window closes, then flush as ordinary typing.
        Ok(Outcome::Continue)
    }

    fn accumulate_paste(&mut self, bytes: &[u8], allow_lone_enter: bool) -> Result<Outcome> {
        // A lone Enter ends the paste without being inserted.
        if allow_lone_enter && bytes.len() == 1 && bytes[0] == 0x0d && !self.paste.buf.is_empty() {
            self.finalize_paste()?;
            return Ok(Outcome::Continue);
        }
        for (i, &byte) in bytes.iter().enumerate() {
            match byte {
                0x1b | 0x08 | 0x7f => {
                    // Paste ends; this byte is ordinary input again.
                    self.finalize_paste()?;
                    let outcome = self.process_byte(byte)?;
                    if outcome != Outcome::Continue {
                        return Ok(outcome);
                    }
                    // Whatever follows is also ordinary input.
                    return self.process_chunk_tail(&bytes[i + 1..]);
                }
                0x0d | 0x0a => self.paste.buf.push('\n'),
                0x09 => self.paste.buf.push('\t'),
                0x20..=0x7e => self.paste.buf.push(byte as char),
                _ => {}
            }
        }
        Ok(Outcome::Continue)
    }

    fn process_chunk_tail(&mut self, bytes: &[u8]) -> Result<Outcome> {
        for &byte in bytes {
            let outcome = self.process_byte(byte)?;
            if outcome != Outcome::Continue {
                return Ok(outcome);
            }
        }
        Ok(Outcome::Continue)
    }

    fn start_paste(&mut self) {
        self.paste.active = true;
        self.paste.buf.clear();
        let burst = std::mem::take(&mut self.burst);
        for byte in burst {
            match byte {
                0x0d | 0x0a => self.paste.buf.push('\n'),
                0x09 => self.paste.buf.push('\t'),
                0x20..=0x7e => self.paste.buf.push(byte as char),
                _ => {}
            }
        }
    }

    fn finalize_paste(&mut self) -> Result<()> {
        self.paste.active = false;
        let mut text = std::mem::take(&mut self.paste.buf);
        if text.ends_with('\n') {
            text.pop();
        }
        if !text.is_empty() {
            self.insert_text(&text);
            self.has_edited = true;
        }
        self.redraw()
    }

    fn flush_burst_as_typed(&mut self) -> Result<Outcome> {
        let burst = std::mem::take(&mut self.burst);
        for byte in burst {
            let outcome = self.process_byte(byte)?;
            if outcome != Outcome::Continue {
                return Ok(outcome);
            }
        }
        Ok(Outcome::Continue)
    }

    fn process_byte(&mut self, byte: u8) -> Result<Outcome> {
        for event in self.parser.feed(byte) {
            let outcome = self.handle_event(event)?;
            if outcome != Outcome::Continue {
                return Ok(outcome);
            }
        }
        Ok(Outcome::Continue)
    }

    fn handle_event(&mut self, event: InputEvent) -> Result<Outcome> {
        match event {
            InputEvent::Char(text) => {
                if self.cursor == self.line.len() && text.chars().count() == 1 {
                    self.append_fast_path(&text)?;
                } else {
                    self.insert_text(&text);
                    self.has_edited = true;
                    self.redraw()?;
                }
                Ok(Outcome::Continue)
            }
            InputEvent::Tab => {
                self.insert_text("\t");
                self.has_edited = true;
                self.redraw()?;
                Ok(Outcome::Continue)
            }
            InputEvent::Backspace => {
                self.backspace()?;
                Ok(Outcome::Continue)
            }
            InputEvent::Delete => {
                self.delete_forward()?;
                Ok(Outcome::Continue)
            }
            InputEvent::Left => {
                self.move_cursor(-1)?;
                Ok(Outcome::Continue)
            }
            InputEvent::Right => {
                self.move_cursor(1)?;
                Ok(Outcome::Continue)
            }
            InputEvent::Home => {
                self.set_cursor(self.current_segment_start());
                self.redraw()?;
                Ok(Outcome::Continue)
            }
            InputEvent::End => {
                self.set_cursor(self.current_segment_end());
                self.redraw()?;
                Ok(Outcome::Continue)
            }
            InputEvent::Up => {
                self.navigate_vertically(-1)?;
                Ok(Outcome::Continue)
            }
            InputEvent::Down => {
                self.navigate_vertically(1)?;
                Ok(Outcome::Continue)
            }
            InputEvent::Enter => {
                self.finish_line()?;
                self.history_index = -1;
                Ok(Outcome::Submit(std::mem::take(&mut self.line)))
            }
            InputEvent::Interrupt => {
                self.clear_edit_area()?;
                Ok(Outcome::Interrupted)
            }
            InputEvent::Suspend => Ok(Outcome::SuspendRequested),
            InputEvent::Escape => Ok(Outcome::Continue),
        }
    }

    // --- editing primitives ---

    fn insert_text(&mut self, text: &str) {
        self.line.insert_str(self.cursor, text);
        self.cursor += text.len();
    }

    fn backspace(&mut self) -> Result<()> {
        if self.cursor == 0 {
            return Ok(());
        }
        let prev = prev_char_boundary(&self.line, self.cursor);
        self.line.replace_range(prev..self.cursor, "");
        self.cursor = prev;
        self.has_edited = true;
        self.redraw()
    }

    fn delete_forward(&mut self) -> Result<()> {
        if self.cursor >= self.line.len() {
            return Ok(());
        }
        let next = next_char_boundary(&self.line, self.cursor);
        self.line.replace_range(self.cursor..next, "");
        self.has_edited = true;
        self.redraw()
    }

    fn move_cursor(&mut self, delta: i32) -> Result<()> {
        if delta < 0 && self.cursor > 0 {
            self.cursor = prev_char_boundary(&self.line, self.cursor);
        } else if delta > 0 && self.cursor < self.line.len() {
            self.cursor = next_char_boundary(&self.line, self.cursor);
        } else {
            return Ok(());
        }
        self.redraw()
    }

    fn set_cursor(&mut self, byte_offset: usize) {
        self.cursor = byte_offset.min(self.line.len());
    }

    // --- vertical navigation ---

    /// Up/Down policy: an empty or history-fresh line navigates
    /// history; an edited line moves between its embedded lines.
    fn navigate_vertically(&mut self, delta: i32) -> Result<()> {
        if self.line.is_empty() || !self.has_edited {
            return self.navigate_history(delta);
        }
        self.navigate_buffer_lines(delta)
    }

    fn navigate_history(&mut self, delta: i32) -> Result<()> {
        if self.history.is_empty() {
            return Ok(());
        }
        let len = self.history.len() as isize;
        let next = if delta < 0 {
            // Older.
            match self.history_index {
                -1 => len - 1,
                0 => 0,
                i => i - 1,
            }
        } else {
            // Newer; past the newest returns to an empty live line.
            match self.history_index {
                -1 => return Ok(()),
                i if i + 1 >= len => -1,
                i => i + 1,
            }
        };

        self.history_index = next;
        if next == -1 {
            self.line.clear();
        } else {
            self.line = self.history[next as usize].clone();
        }
        self.cursor = self.line.len();
        self.has_edited = false;
        self.redraw()
    }

    fn navigate_buffer_lines(&mut self, delta: i32) -> Result<()> {
        let segments: Vec<&str> = self.line.split('\n').collect();
        let (seg_index, col) = self.cursor_segment_position(&segments);
        let target = seg_index as i32 + delta;
        if target < 0 || target as usize >= segments.len() {
            return Ok(());
        }
        let target = target as usize;
        let target_len = segments[target].chars().count();
        let new_col = col.min(target_len);

        let mut offset = 0;
        for segment in segments.iter().take(target) {
            offset += segment.len() + 1;
        }
        let byte_col: usize = segments[target]
            .chars()
            .take(new_col)
            .map(char::len_utf8)
            .sum();
        self.set_cursor(offset + byte_col);
        self.redraw()
    }

    /// `(segment index, code-point column)` of the cursor.
    fn cursor_segment_position(&self, segments: &[&str]) -> (usize, usize) {
        let mut offset = 0;
        for (i, segment) in segments.iter().enumerate() {
            let end = offset + segment.len();
            if self.cursor <= end {
                let col = self.line[offset..self.cursor].chars().count();
                return (i, col);
            }
            offset = end + 1;
        }
        (segments.len().saturating_sub(1), 0)
    }

    fn current_segment_start(&self) -> usize {
        self.line[..self.cursor]
            .rfind('\n')
            .map(|i| i + 1)
            .unwrap_or(0)
    }

    fn current_segment_end(&self) -> usize {
        self.line[self.cursor..]
            .find('\n')
            .map(|i| self.cursor + i)
            .unwrap_or(self.line.len())
    }

    // --- rendering ---

    fn term_width(&self) -> usize {
        let (w, _) = self.controller.size();
        if w == 0 { 80 } else { w as usize }
    }

    fn reset_edit_state(&mut self) {
        self.line.clear();
        self.cursor = 0;
        self.has_edited = false;
        self.history_index = -1;
        self.parser.reset();
        self.burst.clear();
        self.paste = PasteState::default();
        self.last_width = 0;
        self.last_cursor_row = 0;
    }

    fn paint_initial(&mut self) -> Result<()> {
        let prompt = self.prompt.clone();
        self.controller.with_terminal(|m| {
            m.write_text("\r")?;
            m.write_text(&prompt)?;
            m.clear_to_eol()?;
            m.flush()
        })?;
        self.last_width = ansi::visual_width(&self.prompt);
        self.last_cursor_row = ansi::cursor_row(self.last_width, self.term_width());
        Ok(())
    }

    /// End-of-line fast path: echo the character without a repaint.
    fn append_fast_path(&mut self, text: &str) -> Result<()> {
        self.line.push_str(text);
        self.cursor = self.line.len();
        self.has_edited = true;
        let echo = text.to_string();
        self.controller.with_terminal(move |m| {
            m.write_text(&echo)?;
            m.flush()
        })?;
        self.last_width += 1;
        self.last_cursor_row = ansi::cursor_row(self.last_width, self.term_width());
        Ok(())
    }

    /// Repaint the prompt and line, then park the cursor at its edit
    /// position. See the controller notes on immediate sequences: the
    /// whole repaint runs under one terminal lock.
    fn redraw(&mut self) -> Result<()> {
        let term_w = self.term_width();
        let full = format!("{}{}", self.prompt, self.line);
        let new_width = ansi::visual_width(&full);
        let prev_rows = ansi::visual_line_count(term_w, self.last_width);
        let curr_rows = ansi::visual_line_count(term_w, new_width);
        let rows = prev_rows.max(curr_rows);

        let cursor_pos =
            ansi::visual_width(&self.prompt) + ansi::visual_width(&self.line[..self.cursor]);
        let target_row = ansi::cursor_row(cursor_pos, term_w);
        let end_row = ansi::cursor_row(new_width, term_w);
        let target_col = cursor_pos - target_row * term_w;
        let up_from_prev = self.last_cursor_row;

        self.controller.with_terminal(move |m| {
            m.write_text("\r")?;
            if up_from_prev > 0 {
                m.write(ansi::move_up(up_from_prev as u16).as_bytes())?;
            }
            for i in 0..rows {
                m.clear_line()?;
                if i + 1 < rows {
                    m.write(ansi::move_down(1).as_bytes())?;
                }
            }
            if rows > 1 {
                m.write(ansi::move_up((rows - 1) as u16).as_bytes())?;
            }
            m.write_text("\r")?;
            m.write_text(&full)?;
            m.clear_to_eol()?;

            if end_row > target_row {
                m.write(ansi::move_up((end_row - target_row) as u16).as_bytes())?;
            }
            m.write_text("\r")?;
            if target_col > 0 {
                m.write(ansi::move_right(target_col as u16).as_bytes())?;
            }
            m.flush()
        })?;

        self.last_width = new_width;
        self.last_cursor_row = target_row;
        Ok(())
    }

    /// Park the cursor at the end of the edit and emit the newline that
    /// commits the read.
    fn finish_line(&mut self) -> Result<()> {
        let term_w = self.term_width();
        let full_width = ansi::visual_width(&self.prompt) + ansi::visual_width(&self.line);
        let end_row = ansi::cursor_row(full_width, term_w);
        let down = end_row.saturating_sub(self.last_cursor_row);
        self.controller.with_terminal(move |m| {
            if down > 0 {
                m.write(ansi::move_down(down as u16).as_bytes())?;
            }
            m.write_text("\r\n")?;
            m.flush()
        })?;
        self.cursor = 0;
        self.last_width = 0;
        self.last_cursor_row = 0;
        Ok(())
    }

    /// Wipe the edit's rows, leaving the cursor at the first column.
    fn clear_edit_area(&mut self) -> Result<()> {
        let term_w = self.term_width();
        let rows = ansi::visual_line_count(term_w, self.last_width);
        let up_from_prev = self.last_cursor_row;
        self.controller.with_terminal(move |m| {
            m.write_text("\r")?;
            if up_from_prev > 0 {
                m.write(ansi::move_up(up_from_prev as u16).as_bytes())?;
            }
            for i in 0..rows {
                m.clear_line()?;
                if i + 1 < rows {
                    m.write(ansi::move_down(1).as_bytes())?;
                }
            }
            if rows > 1 {
                m.write(ansi::move_up((rows - 1) as u16).as_bytes())?;
            }
            m.write_text("\r")?;
            m.flush()
        })?;
        self.last_width = 0;
        self.last_cursor_row = 0;
        Ok(())
    }

    // --- suspension ---

    /// Ctrl+Z: hand the terminal back, stop, and repaint on resume.
    fn suspend_and_resume(&mut self) -> Result<()> {
        self.controller.with_terminal(|m| {
            m.set_raw_mode(false)?;
            m.write_text("\n")?;
            m.flush()
        })?;

        platform::suspend_process();

        self.controller.with_terminal(|m| m.set_raw_mode(true))?;
        while self.rx.try_recv().is_ok() {}
        self.parser.reset();
        self.burst.clear();
        self.last_byte_at = None;

        let prompt = self.prompt.clone();
        self.controller.with_terminal(|m| {
            m.write_text("\r")?;
            m.write_text(&prompt)?;
            m.flush()
        })?;
        self.last_width = ansi::visual_width(&self.prompt);
        self.last_cursor_row = 0;
        self.redraw()
    }
}

fn is_paste_byte(byte: u8) -> bool {
    matches!(byte, 0x20..=0x7e | 0x09 | 0x0a | 0x0d)
}

fn prev_char_boundary(s: &str, from: usize) -> usize {
    s[..from]
        .char_indices()
        .next_back()
        .map(|(i, _)| i)
        .unwrap_or(0)
}

fn next_char_boundary(s: &str, from: usize) -> usize {
    s[from..]
        .chars()
        .next()
        .map(|c| from + c.len_utf8())
        .unwrap_or(s.len())
}
