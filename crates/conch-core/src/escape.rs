//! Escape-sequence state machine over a raw byte stream.
//!
//! Feed one byte at a time; each call yields at most one decoded event
//! plus, possibly, a flushed pending byte. When a partial sequence is
//! aborted by an unexpected printable byte, that byte is parked in the
//! pending slot and surfaces as a `Char` event on the next feed, so no
//! typed character is ever lost to a stray `ESC`.

/// A decoded input event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InputEvent {
    /// Printable text.
    Char(String),
    /// Up arrow.
    Up,
    /// Down arrow.
    Down,
    /// Left arrow.
    Left,
    /// Right arrow.
    Right,
    /// Home key.
    Home,
    /// End key.
    End,
    /// Backspace.
    Backspace,
    /// Forward delete.
    Delete,
    /// Enter / carriage return.
    Enter,
    /// Tab.
    Tab,
    /// Ctrl+C.
    Interrupt,
    /// Ctrl+Z.
    Suspend,
    /// A bare or aborted escape.
    Escape,
}

/// Parser state. One state per partially-recognized sequence prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Idle,
    GotEsc,
    GotCsi,
    Csi1,
    Csi3,
    Csi4,
    EscO,
}

/// Byte-fed decoder for terminal input sequences.
#[derive(Debug)]
pub struct EscapeParser {
    state: State,
    pending: Option<u8>,
}

impl EscapeParser {
    /// Create a parser in the idle state.
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            pending: None,
        }
    }

    /// Discard any in-progress sequence and pending byte.
    pub fn reset(&mut self) {
        self.state = State::Idle;
        self.pending = None;
    }

    /// Feed one byte; returns the events it produced, in order.
    ///
    /// A pending byte parked by an earlier aborted sequence is flushed as
    /// a `Char` event before the new byte is interpreted. Byte `0` is a
    /// drain poll: it flushes the pending slot and is otherwise inert.
    pub fn feed(&mut self, byte: u8) -> Vec<InputEvent> {
        let mut events = Vec::with_capacity(2);

        if let Some(b) = self.pending.take() {
            events.push(InputEvent::Char((b as char).to_string()));
        }
        if byte == 0 {
            return events;
        }

        match self.state {
            State::Idle => self.feed_idle(byte, &mut events),
            State::GotEsc => self.feed_got_esc(byte, &mut events),
            State::GotCsi => self.feed_got_csi(byte, &mut events),
            State::Csi1 => self.feed_tilde_state(byte, InputEvent::Home, &mut events),
            State::Csi3 => self.feed_tilde_state(byte, InputEvent::Delete, &mut events),
            State::Csi4 => self.feed_tilde_state(byte, InputEvent::End, &mut events),
            State::EscO => self.feed_esc_o(byte, &mut events),
        }

        events
    }

    fn feed_idle(&mut self, byte: u8, events: &mut Vec<InputEvent>) {
        match byte {
            0x1b => self.state = State::GotEsc,
            0x08 | 0x7f => events.push(InputEvent::Backspace),
            0x0d => events.push(InputEvent::Enter),
            0x09 => events.push(InputEvent::Tab),
            0x03 => events.push(InputEvent::Interrupt),
            0x1a => events.push(InputEvent::Suspend),
            0x20..=0x7e => events.push(InputEvent::Char((byte as char).to_string())),
            _ => {}
        }
    }

    fn feed_got_esc(&mut self, byte: u8, events: &mut Vec<InputEvent>) {
        match byte {
            b'[' => self.state = State::GotCsi,
            b'O' => self.state = State::EscO,
            0x20..=0x7e => {
                // Aborted escape: the byte is real input, park it.
                self.state = State::Idle;
                self.pending = Some(byte);
                events.push(InputEvent::Escape);
            }
            _ => {
                self.state = State::Idle;
                events.push(InputEvent::Escape);
            }
        }
    }

    fn feed_got_csi(&mut self, byte: u8, events: &mut Vec<InputEvent>) {
        match byte {
            b'A' => {
                self.state = State::Idle;
                events.push(InputEvent::Up);
            }
            b'B' => {
                self.state = State::Idle;
                events.push(InputEvent::Down);
            }
            b'C' => {
                self.state = State::Idle;
                events.push(InputEvent::Right);
            }
            b'D' => {
                self.state = State::Idle;
                events.push(InputEvent::Left);
            }
            b'H' => {
                self.state = State::Idle;
                events.push(InputEvent::Home);
            }
            b'F' => {
                self.state = State::Idle;
                events.push(InputEvent::End);
            }
            b'1' => self.state = State::Csi1,
            b'3' => self.state = State::Csi3,
            b'4' => self.state = State::Csi4,
            b'0' | b'2' | b'5'..=b'9' | b';' => {}
            0x20..=0x7e => {
                self.state = State::Idle;
                self.pending = Some(byte);
                events.push(InputEvent::Escape);
            }
            _ => {
                self.state = State::Idle;
                events.push(InputEvent::Escape);
            }
        }
    }

    fn feed_tilde_state(&mut self, byte: u8, on_tilde: InputEvent, events: &mut Vec<InputEvent>) {
        self.state = State::Idle;
        match byte {
            b'~' => events.push(on_tilde),
            0x20..=0x7e => {
                self.pending = Some(byte);
                events.push(InputEvent::Escape);
            }
            _ => events.push(InputEvent::Escape),
        }
    }

    fn feed_esc_o(&mut self, byte: u8, events: &mut Vec<InputEvent>) {
        self.state = State::Idle;
        match byte {
            b'H' => events.push(InputEvent::Home),
            b'F' => events.push(InputEvent::End),
            0x20..=0x7e => {
                self.pending = Some(byte);
                events.push(InputEvent::Escape);
            }
            _ => events.push(InputEvent::Escape),
        }
    }
}

impl Default for EscapeParser {
    fn default() -> Self {
        Self::new()
    }
}
