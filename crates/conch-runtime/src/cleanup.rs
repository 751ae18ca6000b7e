//! Process-wide cleanup chain.
//!
//! Terminal restoration must happen exactly once no matter how the
//! process dies: normal exit, panic, or fatal signal. Steps registered
//! here run in reverse registration order behind a latch; the panic
//! hook runs them before unwinding continues, and the optional signal
//! handler runs them before re-raising the signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};

use crate::platform;

type CleanupFn = Box<dyn FnMut() + Send>;

static REGISTRY: OnceLock<Mutex<Vec<CleanupFn>>> = OnceLock::new();
static RAN: AtomicBool = AtomicBool::new(false);

fn registry() -> &'static Mutex<Vec<CleanupFn>> {
    REGISTRY.get_or_init(|| Mutex::new(Vec::new()))
}

/// Add a cleanup step; steps run in reverse registration order.
pub fn register_cleanup(step: impl FnMut() + Send + 'static) {
    if let Ok(mut steps) = registry().lock() {
        steps.push(Box::new(step));
    }
}

/// Run the chain. Latched: only the first call does anything.
pub fn run_cleanup() {
    if RAN.swap(true, Ordering::SeqCst) {
        return;
    }
    let mut steps = match registry().lock() {
        Ok(mut steps) => std::mem::take(&mut *steps),
        Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
    };
    for step in steps.iter_mut().rev() {
        step();
    }
}

/// Whether the chain has already run.
pub fn cleanup_has_run() -> bool {
    RAN.load(Ordering::SeqCst)
}

/// Chain the cleanup run in front of the existing panic hook, so the
/// terminal is restored before the panic message prints and unwinding
/// continues.
pub fn install_panic_hook() {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        run_cleanup();
        previous(info);
    }));
}

/// Spawn a last-resort task that runs the chain on a fatal signal and
/// then re-raises it so the process exits with the platform-default
/// status.
///
/// Interactive flows normally see Ctrl+C as a raw byte; this guards
/// the non-interactive paths (`kill`, terminal hangup).
pub fn install_signal_handler() {
    tokio::spawn(async {
        let mut signals = match platform::InterruptSignals::new() {
            Ok(signals) => signals,
            Err(e) => {
                tracing::warn!("cannot install last-resort signal handler: {e}");
                return;
            }
        };
        let signum = signals.recv().await;
        run_cleanup();
        platform::re_raise(signum);
    });
}
