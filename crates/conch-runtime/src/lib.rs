//! conch-runtime: the async layer of the conch console runtime.
//!
//! Hosts pluggable components atop a single terminal: the controller
//! (priority render queue, reference-counted raw mode and alternate
//! screen, signal fan-out), the event bus, the state manager, the
//! multi-line input reader, the component registry and main loop, and
//! the process-wide cleanup chain.

pub mod cleanup;
pub mod component;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod input;
pub mod platform;
pub mod runtime;
pub mod state;

pub use component::{Component, ComponentContext, Dependencies};
pub use config::RuntimeConfig;
pub use controller::{RawModeGuard, RenderOp, TerminalController};
pub use error::{Result, RuntimeError};
pub use events::{Event, EventBus, EventHandler};
pub use input::{InputReader, stdin_byte_stream};
pub use runtime::ComponentRuntime;
pub use state::{StateCallback, StateManager};
