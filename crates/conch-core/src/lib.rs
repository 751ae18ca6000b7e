//! conch-core: terminal facade, input decoding, and display primitives
//! for the conch console runtime.
//!
//! This crate holds the synchronous leaves: the terminal manager trait
//! with tty and test backends, CSI sequence building and ANSI-aware
//! width math, the escape-sequence parser, the wrapped console
//! backbuffer, and the named-region layout manager. The async layer
//! (controller, event bus, components) lives in `conch-runtime`.

pub mod ansi;
pub mod console;
pub mod error;
pub mod escape;
pub mod layout;
pub mod terminal;
pub mod wrap;

pub use console::{ConsoleBuffer, WrappedLine, DEFAULT_MAX_LINES};
pub use error::{CoreError, Result};
pub use escape::{EscapeParser, InputEvent};
pub use layout::{LayoutManager, Region};
pub use terminal::{TermCall, TerminalManager, TestTerminal, TestTerminalHandle, TtyTerminal};
pub use wrap::wrap_line;
