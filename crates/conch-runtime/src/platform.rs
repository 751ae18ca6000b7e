//! Platform capability set: signal streams, suspension, re-raising.
//!
//! Where a capability is absent (non-Unix resize signal), the stream
//! degrades to a 500 ms poll tick and size changes are detected by
//! querying the terminal.

use std::io;

/// Poll interval used when no resize signal exists.
#[cfg(not(unix))]
pub const RESIZE_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(500);

/// Stream of terminal-resize notifications.
pub struct ResizeSignal {
    #[cfg(unix)]
    inner: tokio::signal::unix::Signal,
    #[cfg(not(unix))]
    inner: tokio::time::Interval,
}

impl ResizeSignal {
    /// Subscribe to the platform's resize notification.
    pub fn new() -> io::Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            Ok(Self {
                inner: signal(SignalKind::window_change())?,
            })
        }
        #[cfg(not(unix))]
        {
            let mut interval = tokio::time::interval(RESIZE_POLL_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            Ok(Self { inner: interval })
        }
    }

    /// Wait for the next resize hint (signal or poll tick).
    pub async fn recv(&mut self) {
        #[cfg(unix)]
        {
            self.inner.recv().await;
        }
        #[cfg(not(unix))]
        {
            self.inner.tick().await;
        }
    }
}

/// Stream of interrupt-class signals (SIGINT plus SIGTERM on Unix).
pub struct InterruptSignals {
    #[cfg(unix)]
    int: tokio::signal::unix::Signal,
    #[cfg(unix)]
    term: tokio::signal::unix::Signal,
    #[cfg(not(unix))]
    _marker: (),
}

impl InterruptSignals {
    /// Subscribe to the interrupt signal set.
    pub fn new() -> io::Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            Ok(Self {
                int: signal(SignalKind::interrupt())?,
                term: signal(SignalKind::terminate())?,
            })
        }
        #[cfg(not(unix))]
        {
            Ok(Self { _marker: () })
        }
    }

    /// Wait for the next interrupt-class signal; returns its number.
    pub async fn recv(&mut self) -> i32 {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = self.int.recv() => nix::sys::signal::Signal::SIGINT as i32,
                _ = self.term.recv() => nix::sys::signal::Signal::SIGTERM as i32,
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            2
        }
    }
}

/// Stop the process the way shell job control expects (SIGTSTP).
///
/// Returns when the process has been resumed. A no-op off Unix.
pub fn suspend_process() {
    #[cfg(unix)]
    {
        if let Err(e) = nix::sys::signal::raise(nix::sys::signal::Signal::SIGTSTP) {
            tracing::warn!("failed to raise SIGTSTP: {e}");
        }
    }
}

/// Re-raise `signum` with the default disposition restored, so the
/// process dies with the platform-default exit status after cleanup.
pub fn re_raise(signum: i32) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{SigHandler, Signal, raise, signal};
        if let Ok(sig) = Signal::try_from(signum) {
            unsafe {
                let _ = signal(sig, SigHandler::SigDfl);
            }
            let _ = raise(sig);
        }
    }
    #[cfg(not(unix))]
    {
        std::process::exit(128 + signum);
    }
}
