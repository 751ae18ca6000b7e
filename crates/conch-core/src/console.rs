//! Append-only bounded console backbuffer.
//!
//! Stores raw appended lines (ANSI preserved) and derives width-wrapped
//! display lines lazily. Scroll position is measured in wrapped lines
//! above the newest output; 0 means pinned to the bottom.

use std::collections::VecDeque;

use crate::wrap;

/// Default maximum number of stored source lines.
pub const DEFAULT_MAX_LINES: usize = 10_000;

/// One physical display row derived from a source line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WrappedLine {
    /// The fragment's text, ANSI preserved.
    pub content: String,
    /// Index of the source line this fragment came from.
    pub source_index: usize,
    /// Position of this fragment among the source line's fragments.
    pub wrap_index: usize,
}

/// Bounded append-only log with width-aware wrapping and scrolling.
#[derive(Debug)]
pub struct ConsoleBuffer {
    lines: VecDeque<String>,
    max_lines: usize,
    term_width: usize,
    wrapped: Vec<WrappedLine>,
    wrap_dirty: bool,
    scroll_position: usize,
}

impl ConsoleBuffer {
    /// Create a buffer with the default line cap.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_LINES)
    }

    /// Create a buffer holding at most `max_lines` source lines.
    pub fn with_capacity(max_lines: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            max_lines: max_lines.max(1),
            term_width: 80,
            wrapped: Vec::new(),
            wrap_dirty: true,
            scroll_position: 0,
        }
    }

    /// Append one line; the oldest lines are dropped past the cap.
    pub fn add_line(&mut self, line: impl Into<String>) {
        self.lines.push_back(line.into());
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
        self.wrap_dirty = true;
    }

    /// Split `content` on newlines and append each line.
    ///
    /// A trailing empty fragment (from content ending in `\n`) is not
    /// appended; interior empty lines are kept.
    pub fn add_content(&mut self, content: &str) {
        let mut parts = content.split('\n').peekable();
        while let Some(part) = parts.next() {
            if parts.peek().is_none() && part.is_empty() {
                break;
            }
            self.add_line(part);
        }
    }

    /// Update the wrap width; marks the derivation dirty on change.
    pub fn set_terminal_width(&mut self, width: usize) {
        if width != self.term_width {
            self.term_width = width;
            self.wrap_dirty = true;
        }
    }

    /// Remove all lines and reset scrolling.
    pub fn clear(&mut self) {
        self.lines.clear();
        self.wrapped.clear();
        self.wrap_dirty = true;
        self.scroll_position = 0;
    }

    /// Number of stored source lines.
    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// Number of wrapped display lines at the current width.
    pub fn wrapped_count(&mut self) -> usize {
        self.rewrap_if_dirty();
        self.wrapped.len()
    }

    /// Current scroll position in wrapped lines above the bottom.
    pub fn scroll_position(&self) -> usize {
        self.scroll_position
    }

    /// Scroll back by `n` wrapped lines, clamped to the oldest.
    pub fn scroll_up(&mut self, n: usize) {
        self.rewrap_if_dirty();
        let max = self.wrapped.len().saturating_sub(1);
        self.scroll_position = (self.scroll_position + n).min(max);
    }

    /// Scroll forward by `n` wrapped lines, floor 0.
    pub fn scroll_down(&mut self, n: usize) {
        self.scroll_position = self.scroll_position.saturating_sub(n);
    }

    /// Pin the view back to the newest output.
    pub fn scroll_to_bottom(&mut self) {
        self.scroll_position = 0;
    }

    /// The slice of wrapped lines visible in a viewport of `height` rows,
    /// ending `scroll_position` lines above the newest.
    pub fn get_visible_lines(&mut self, height: usize) -> &[WrappedLine] {
        self.rewrap_if_dirty();
        let total = self.wrapped.len();
        let scroll = self.scroll_position.min(total.saturating_sub(1));
        let end = total - scroll;
        let start = end.saturating_sub(height);
        &self.wrapped[start..end]
    }

    fn rewrap_if_dirty(&mut self) {
        if !self.wrap_dirty {
            return;
        }
        self.wrapped.clear();
        for (source_index, line) in self.lines.iter().enumerate() {
            for (wrap_index, content) in
                wrap::wrap_line(line, self.term_width).into_iter().enumerate()
            {
                self.wrapped.push(WrappedLine {
                    content,
                    source_index,
                    wrap_index,
                });
            }
        }
        self.wrap_dirty = false;
    }
}

impl Default for ConsoleBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_buffer() {
        let mut buf = ConsoleBuffer::new();
        assert_eq!(buf.line_count(), 0);
        assert!(buf.get_visible_lines(5).is_empty());
    }

    #[test]
    fn add_and_view() {
        let mut buf = ConsoleBuffer::new();
        buf.add_line("one");
        buf.add_line("two");
        let visible = buf.get_visible_lines(5);
        assert_eq!(visible.len(), 2);
        assert_eq!(visible[0].content, "one");
        assert_eq!(visible[1].content, "two");
    }

    #[test]
    fn viewport_shows_newest() {
        let mut buf = ConsoleBuffer::new();
        for i in 0..10 {
            buf.add_line(format!("line {i}"));
        }
        let visible = buf.get_visible_lines(3);
        assert_eq!(visible.len(), 3);
        assert_eq!(visible[2].content, "line 9");
    }

    #[test]
    fn cap_drops_oldest() {
        let mut buf = ConsoleBuffer::with_capacity(3);
        for i in 0..5 {
            buf.add_line(format!("{i}"));
        }
        assert_eq!(buf.line_count(), 3);
        let visible = buf.get_visible_lines(3);
        assert_eq!(visible[0].content, "2");
        assert_eq!(visible[2].content, "4");
    }

    #[test]
    fn add_content_splits_lines() {
        let mut buf = ConsoleBuffer::new();
        buf.add_content("a\nb\nc\n");
        assert_eq!(buf.line_count(), 3);
        buf.add_content("d\n\ne");
        assert_eq!(buf.line_count(), 6);
    }

    #[test]
    fn wrapping_tracks_source_index() {
        let mut buf = ConsoleBuffer::new();
        buf.set_terminal_width(10);
        buf.add_line("short");
        buf.add_line("a much longer line that wraps");
        let visible = buf.get_visible_lines(10);
        assert!(visible.len() > 2);
        assert_eq!(visible[0].source_index, 0);
        assert!(visible[1..].iter().all(|l| l.source_index == 1));
        assert_eq!(visible[1].wrap_index, 0);
        assert_eq!(visible[2].wrap_index, 1);
    }

    #[test]
    fn list_marker_wrap() {
        // S2: bullet fragment keeps the marker and its first word.
        let mut buf = ConsoleBuffer::new();
        buf.set_terminal_width(10);
        buf.add_line("• first second");
        let visible = buf.get_visible_lines(10);
        assert_eq!(visible.len(), 2);
        assert_eq!(visible[0].content, "• first");
        assert_eq!(visible[1].content, "second");
    }

    #[test]
    fn scroll_bounds() {
        let mut buf = ConsoleBuffer::new();
        for i in 0..5 {
            buf.add_line(format!("{i}"));
        }
        buf.scroll_up(100);
        assert_eq!(buf.scroll_position(), 4);
        buf.scroll_down(2);
        assert_eq!(buf.scroll_position(), 2);
        buf.scroll_to_bottom();
        assert_eq!(buf.scroll_position(), 0);
    }

    #[test]
    fn scrolled_view_ends_above_newest() {
        let mut buf = ConsoleBuffer::new();
        for i in 0..10 {
            buf.add_line(format!("line {i}"));
        }
        buf.scroll_up(3);
        let visible = buf.get_visible_lines(2);
        assert_eq!(visible.last().map(|l| l.content.as_str()), Some("line 6"));
    }

    #[test]
    fn width_change_rewraps() {
        let mut buf = ConsoleBuffer::new();
        buf.set_terminal_width(80);
        buf.add_line("abcdefghij");
        assert_eq!(buf.wrapped_count(), 1);
        buf.set_terminal_width(5);
        assert_eq!(buf.wrapped_count(), 2);
    }

    #[test]
    fn clear_resets() {
        let mut buf = ConsoleBuffer::new();
        buf.add_line("x");
        buf.scroll_up(1);
        buf.clear();
        assert_eq!(buf.line_count(), 0);
        assert_eq!(buf.scroll_position(), 0);
    }
}
