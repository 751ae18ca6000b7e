//! Terminal controller: the single gateway between components and the
//! physical terminal.
//!
//! Rendering flows through a bounded priority queue drained by a writer
//! task; cursor and scroll-region control runs immediately under the
//! manager mutex so a component's compound sequences are never
//! interleaved with queued writes. Raw mode and the alternate screen
//! are reference-counted; OS resize and interrupt signals fan out to
//! the event bus.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use conch_core::terminal::TerminalManager;

use crate::error::Result;
use crate::events::{Event, EventBus};
use crate::platform::{InterruptSignals, ResizeSignal};

/// Capacity of the render queue.
pub const RENDER_QUEUE_CAPACITY: usize = 1024;
/// Maximum ops executed per writer batch.
const BATCH_MAX: usize = 10;
/// Longest a partially-filled batch waits for more ops.
const BATCH_WINDOW: Duration = Duration::from_millis(5);
/// How long `flush` waits for its sentinel op to execute.
const FLUSH_TIMEOUT: Duration = Duration::from_millis(100);
/// Debounce window applied to resize signals.
const RESIZE_DEBOUNCE: Duration = Duration::from_millis(100);
/// Queue-sync timeout inside `with_primary_screen`.
const PRIMARY_SYNC_TIMEOUT: Duration = Duration::from_millis(250);
/// Priority of the flush sentinel op.
const FLUSH_PRIORITY: i32 = 999;
/// Priority of queued alternate-screen transitions.
const ALT_SCREEN_PRIORITY: i32 = 2;

/// Event type published after a debounced size change.
pub const EVENT_RESIZED: &str = "terminal.resized";
/// Event type published when an interrupt signal arrives.
pub const EVENT_INTERRUPTED: &str = "terminal.interrupted";

type SharedManager = Arc<StdMutex<Box<dyn TerminalManager>>>;
type RenderAction = Box<dyn FnOnce(&mut dyn TerminalManager) -> conch_core::Result<()> + Send>;
type InterruptHandler = Arc<dyn Fn() + Send + Sync>;

/// One queued rendering operation.
pub struct RenderOp {
    /// Label used in render-error logging.
    pub kind: String,
    /// Higher runs earlier within a batch.
    pub priority: i32,
    action: RenderAction,
    done: Option<oneshot::Sender<()>>,
}

impl RenderOp {
    /// Create an op from a closure over the terminal manager.
    pub fn new(
        kind: impl Into<String>,
        priority: i32,
        action: impl FnOnce(&mut dyn TerminalManager) -> conch_core::Result<()> + Send + 'static,
    ) -> Self {
        Self {
            kind: kind.into(),
            priority,
            action: Box::new(action),
            done: None,
        }
    }

    fn with_completion(mut self, done: oneshot::Sender<()>) -> Self {
        self.done = Some(done);
        self
    }
}

#[derive(Debug)]
struct ModeState {
    raw_base: bool,
    raw_refs: usize,
    alt_depth: usize,
    mouse_requested: bool,
    mouse_active: bool,
    size: (u16, u16),
}

/// RAII handle for a temporary raw-mode acquisition.
///
/// Releasing (or dropping) decrements the reference count exactly once.
pub struct RawModeGuard {
    controller: Arc<TerminalController>,
    released: bool,
}

impl RawModeGuard {
    /// Release the acquisition; further calls are no-ops.
    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.controller.release_raw_ref();
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Owner of the terminal manager and hub for rendering, modes, and
/// signals.
pub struct TerminalController {
    manager: SharedManager,
    mode: Arc<StdMutex<ModeState>>,
    bus: Arc<EventBus>,
    render_tx: StdMutex<Option<mpsc::Sender<RenderOp>>>,
    render_rx: StdMutex<Option<mpsc::Receiver<RenderOp>>>,
    writer: StdMutex<Option<JoinHandle<()>>>,
    monitor: StdMutex<Option<JoinHandle<()>>>,
    cancel: watch::Sender<bool>,
    interrupt_handler: Arc<StdMutex<Option<InterruptHandler>>>,
    cleaned_up: AtomicBool,
}

impl TerminalController {
    /// Wrap a terminal manager. Tasks are not spawned until
    /// [`init`](Self::init).
    pub fn new(manager: Box<dyn TerminalManager>, bus: Arc<EventBus>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(RENDER_QUEUE_CAPACITY);
        let (cancel, _) = watch::channel(false);
        Arc::new(Self {
            manager: Arc::new(StdMutex::new(manager)),
            mode: Arc::new(StdMutex::new(ModeState {
                raw_base: false,
                raw_refs: 0,
                alt_depth: 0,
                mouse_requested: false,
                mouse_active: false,
                size: (0, 0),
            })),
            bus,
            render_tx: StdMutex::new(Some(tx)),
            render_rx: StdMutex::new(Some(rx)),
            writer: StdMutex::new(None),
            monitor: StdMutex::new(None),
            cancel,
            interrupt_handler: Arc::new(StdMutex::new(None)),
            cleaned_up: AtomicBool::new(false),
        })
    }

    /// Initialize the manager, cache the size, and spawn the writer and
    /// signal-monitor tasks.
    pub fn init(self: &Arc<Self>) -> Result<()> {
        {
            let mut mgr = lock_manager(&self.manager);
            mgr.init()?;
            let size = mgr.size()?;
            drop(mgr);
            lock_mode(&self.mode).size = size;
        }

        let rx = lock_opt(&self.render_rx).take();
        if let Some(rx) = rx {
            let manager = Arc::clone(&self.manager);
            let cancel = self.cancel.subscribe();
            let handle = tokio::spawn(writer_loop(rx, manager, cancel));
            *lock_opt(&self.writer) = Some(handle);
        }

        let monitor = tokio::spawn(monitor_loop(
            Arc::clone(&self.manager),
            Arc::clone(&self.mode),
            Arc::clone(&self.bus),
            Arc::clone(&self.interrupt_handler),
            self.cancel.subscribe(),
        ));
        *lock_opt(&self.monitor) = Some(monitor);
        Ok(())
    }

    // --- render queue ---

    /// Enqueue a rendering op; drops silently if the queue is closed.
    pub fn queue_render(&self, op: RenderOp) {
        let guard = lock_opt(&self.render_tx);
        if let Some(tx) = guard.as_ref() {
            if let Err(mpsc::error::TrySendError::Full(op)) = tx.try_send(op) {
                tracing::warn!("render queue full, dropping op '{}'", op.kind);
            }
        }
    }

    /// Enqueue a flush sentinel and wait for it, up to 100 ms.
    ///
    /// Timing out is not an error; the writer will still flush.
    pub async fn flush(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        let op =
            RenderOp::new("flush", FLUSH_PRIORITY, |m| m.flush()).with_completion(done_tx);
        self.queue_render(op);
        let _ = tokio::time::timeout(FLUSH_TIMEOUT, done_rx).await;
        Ok(())
    }

    // --- immediate surface ---

    /// Run a compound sequence against the terminal under the manager
    /// mutex. No queued op can interleave while `f` runs; use this for
    /// cursor choreography that must stay contiguous.
    pub fn with_terminal<R>(
        &self,
        f: impl FnOnce(&mut dyn TerminalManager) -> conch_core::Result<R>,
    ) -> Result<R> {
        let mut mgr = lock_manager(&self.manager);
        f(mgr.as_mut()).map_err(Into::into)
    }

    /// Move the cursor immediately.
    pub fn move_cursor(&self, x: u16, y: u16) -> Result<()> {
        self.with_terminal(|m| m.move_cursor(x, y))
    }

    /// Save the cursor position immediately.
    pub fn save_cursor(&self) -> Result<()> {
        self.with_terminal(|m| m.save_cursor())
    }

    /// Restore the cursor position immediately.
    pub fn restore_cursor(&self) -> Result<()> {
        self.with_terminal(|m| m.restore_cursor())
    }

    /// Hide the cursor immediately.
    pub fn hide_cursor(&self) -> Result<()> {
        self.with_terminal(|m| m.hide_cursor())
    }

    /// Show the cursor immediately.
    pub fn show_cursor(&self) -> Result<()> {
        self.with_terminal(|m| m.show_cursor())
    }

    /// Clear the current line immediately.
    pub fn clear_line(&self) -> Result<()> {
        self.with_terminal(|m| m.clear_line())
    }

    /// Clear to end of line immediately.
    pub fn clear_to_eol(&self) -> Result<()> {
        self.with_terminal(|m| m.clear_to_eol())
    }

    /// Clear the screen immediately.
    pub fn clear_screen(&self) -> Result<()> {
        self.with_terminal(|m| m.clear_screen())
    }

    /// Set the scroll region immediately.
    pub fn set_scroll_region(&self, top: u16, bottom: u16) -> Result<()> {
        self.with_terminal(|m| m.set_scroll_region(top, bottom))
    }

    /// Reset the scroll region immediately.
    pub fn reset_scroll_region(&self) -> Result<()> {
        self.with_terminal(|m| m.reset_scroll_region())
    }

    /// Scroll up immediately.
    pub fn scroll_up(&self, n: u16) -> Result<()> {
        self.with_terminal(|m| m.scroll_up(n))
    }

    /// Scroll down immediately.
    pub fn scroll_down(&self, n: u16) -> Result<()> {
        self.with_terminal(|m| m.scroll_down(n))
    }

    /// Write raw bytes immediately.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        self.with_terminal(|m| m.write(data))
    }

    /// Write text immediately, `\n` translated while raw.
    pub fn write_text(&self, text: &str) -> Result<()> {
        self.with_terminal(|m| m.write_text(text))
    }

    /// Position the cursor and write immediately.
    pub fn write_at(&self, x: u16, y: u16, data: &[u8]) -> Result<()> {
        self.with_terminal(|m| m.write_at(x, y, data))
    }

    /// Flush immediately on the calling task, bypassing the queue.
    pub fn flush_direct(&self) -> Result<()> {
        self.with_terminal(|m| m.flush())
    }

    // --- size ---

    /// Last cached terminal size.
    pub fn size(&self) -> (u16, u16) {
        lock_mode(&self.mode).size
    }

    /// Query the terminal for its size and refresh the cache.
    pub fn query_size(&self) -> Result<(u16, u16)> {
        let size = self.with_terminal(|m| m.size())?;
        lock_mode(&self.mode).size = size;
        Ok(size)
    }

    // --- raw mode ---

    /// Set the persistent raw-mode baseline.
    pub fn set_raw_mode(&self, enabled: bool) -> Result<()> {
        let mut mode = lock_mode(&self.mode);
        mode.raw_base = enabled;
        self.apply_raw_locked(&mode)
    }

    /// Temporarily hold raw mode on; the guard's release decrements.
    pub fn acquire_raw_mode(self: &Arc<Self>, reason: &str) -> Result<RawModeGuard> {
        tracing::debug!("raw mode acquired: {reason}");
        {
            let mut mode = lock_mode(&self.mode);
            mode.raw_refs += 1;
            self.apply_raw_locked(&mode)?;
        }
        Ok(RawModeGuard {
            controller: Arc::clone(self),
            released: false,
        })
    }

    fn release_raw_ref(&self) {
        let mut mode = lock_mode(&self.mode);
        if mode.raw_refs == 0 {
            tracing::warn!("raw-mode release without acquisition");
            return;
        }
        mode.raw_refs -= 1;
        if let Err(e) = self.apply_raw_locked(&mode) {
            tracing::warn!("raw mode restore failed: {e}");
        }
    }

    /// Whether the manager is currently in raw mode.
    pub fn is_raw_mode(&self) -> bool {
        lock_manager(&self.manager).is_raw_mode()
    }

    fn apply_raw_locked(&self, mode: &ModeState) -> Result<()> {
        let desired = mode.raw_base || mode.raw_refs > 0;
        let mut mgr = lock_manager(&self.manager);
        if mgr.is_raw_mode() != desired {
            mgr.set_raw_mode(desired)?;
        }
        Ok(())
    }

    // --- alternate screen ---

    /// Queue an alternate-screen entry and bump the depth counter.
    pub fn enter_alt_screen(&self) {
        let enable_mouse = {
            let mut mode = lock_mode(&self.mode);
            mode.alt_depth += 1;
            let transition = mode.alt_depth == 1 && mode.mouse_requested;
            if transition {
                mode.mouse_active = true;
            }
            transition
        };
        self.queue_render(RenderOp::new(
            "alt_screen_enter",
            ALT_SCREEN_PRIORITY,
            move |m| {
                m.enter_alt_screen()?;
                if enable_mouse {
                    m.enable_mouse()?;
                }
                Ok(())
            },
        ));
    }

    /// Queue an alternate-screen exit; underflow is logged, not applied.
    pub fn exit_alt_screen(&self) {
        {
            let mut mode = lock_mode(&self.mode);
            if mode.alt_depth == 0 {
                tracing::warn!("alt-screen exit with depth 0");
                return;
            }
            mode.alt_depth -= 1;
        }
        self.queue_render(RenderOp::new("alt_screen_exit", ALT_SCREEN_PRIORITY, |m| {
            m.exit_alt_screen()
        }));
    }

    /// Current alternate-screen nesting depth.
    pub fn alt_screen_depth(&self) -> usize {
        lock_mode(&self.mode).alt_depth
    }

    /// Run `f` on the primary screen, then restore the previous
    /// alternate-screen depth (and mouse reporting, if requested).
    ///
    /// The render queue is synced first so queued output lands before
    /// the screen switches; the switch itself runs immediately.
    pub async fn with_primary_screen<R>(
        &self,
        f: impl FnOnce(&mut dyn TerminalManager) -> conch_core::Result<R>,
    ) -> Result<R> {
        let _ = tokio::time::timeout(PRIMARY_SYNC_TIMEOUT, self.flush()).await;

        let (depth, mouse_requested) = {
            let mode = lock_mode(&self.mode);
            (mode.alt_depth, mode.mouse_requested)
        };

        let mut mgr = lock_manager(&self.manager);
        for _ in 0..depth {
            if let Err(e) = mgr.exit_alt_screen() {
                tracing::warn!("alt-screen exit failed: {e}");
            }
        }
        let result = f(mgr.as_mut());
        for _ in 0..depth {
            if let Err(e) = mgr.enter_alt_screen() {
                tracing::warn!("alt-screen re-enter failed: {e}");
            }
        }
        if depth > 0 && mouse_requested {
            if let Err(e) = mgr.enable_mouse() {
                tracing::warn!("mouse re-enable failed: {e}");
            }
        }
        let _ = mgr.flush();
        result.map_err(Into::into)
    }

    // --- mouse ---

    /// Request (or drop) mouse reporting; applies immediately.
    pub fn set_mouse_enabled(&self, enabled: bool) -> Result<()> {
        let mut mode = lock_mode(&self.mode);
        mode.mouse_requested = enabled;
        let mut mgr = lock_manager(&self.manager);
        if enabled && !mode.mouse_active {
            mgr.enable_mouse()?;
            mode.mouse_active = true;
        } else if !enabled && mode.mouse_active {
            mgr.disable_mouse()?;
            mode.mouse_active = false;
        }
        Ok(())
    }

    // --- signals ---

    /// Install the handler invoked (on a detached task) per interrupt.
    pub fn on_interrupt(&self, handler: impl Fn() + Send + Sync + 'static) {
        *lock_opt(&self.interrupt_handler) = Some(Arc::new(handler));
    }

    // --- cleanup ---

    /// Tear down tasks and restore the terminal. Latched: only the
    /// first call does work.
    pub async fn cleanup(&self) -> Result<()> {
        if self.cleaned_up.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.cancel.send(true);

        // Closing the queue ends the writer after it drains.
        lock_opt(&self.render_tx).take();
        let writer = lock_opt(&self.writer).take();
        if let Some(handle) = writer {
            let _ = handle.await;
        }
        let monitor = lock_opt(&self.monitor).take();
        if let Some(handle) = monitor {
            let _ = handle.await;
        }

        let mouse_active = lock_mode(&self.mode).mouse_active;
        let result = {
            let mut mgr = lock_manager(&self.manager);
            if mouse_active {
                if let Err(e) = mgr.disable_mouse() {
                    tracing::warn!("mouse disable failed during cleanup: {e}");
                }
            }
            mgr.cleanup()
        };

        if result.is_ok() {
            let mut mode = lock_mode(&self.mode);
            mode.alt_depth = 0;
            mode.raw_refs = 0;
            mode.mouse_requested = false;
            mode.mouse_active = false;
        }
        result.map_err(Into::into)
    }
}

fn lock_manager(
    manager: &SharedManager,
) -> std::sync::MutexGuard<'_, Box<dyn TerminalManager>> {
    match manager.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn lock_mode(mode: &StdMutex<ModeState>) -> std::sync::MutexGuard<'_, ModeState> {
    match mode.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn lock_opt<T>(slot: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    match slot.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Drain the render queue in priority-ordered batches.
async fn writer_loop(
    mut rx: mpsc::Receiver<RenderOp>,
    manager: SharedManager,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        let first = tokio::select! {
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    break;
                }
                continue;
            }
            op = rx.recv() => match op {
                Some(op) => op,
                None => break,
            },
        };

        let mut batch = vec![first];
        let deadline = tokio::time::Instant::now() + BATCH_WINDOW;
        while batch.len() < BATCH_MAX {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(op)) => batch.push(op),
                Ok(None) | Err(_) => break,
            }
        }

        // Stable sort: ties keep enqueue order.
        batch.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut mgr = lock_manager(&manager);
        for op in batch {
            let RenderOp { kind, action, done, .. } = op;
            if let Err(e) = action(mgr.as_mut()) {
                tracing::error!("Render error in {kind}: {e}");
            }
            if let Some(done) = done {
                let _ = done.send(());
            }
        }
        if let Err(e) = mgr.flush() {
            tracing::error!("Render error in flush: {e}");
        }
    }
}

/// Watch resize and interrupt signals, debounce, and publish to the bus.
async fn monitor_loop(
    manager: SharedManager,
    mode: Arc<StdMutex<ModeState>>,
    bus: Arc<EventBus>,
    interrupt_handler: Arc<StdMutex<Option<InterruptHandler>>>,
    mut cancel: watch::Receiver<bool>,
) {
    let mut resize = match ResizeSignal::new() {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!("resize signal unavailable: {e}");
            return;
        }
    };
    let mut interrupts = match InterruptSignals::new() {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!("interrupt signals unavailable: {e}");
            return;
        }
    };

    loop {
        tokio::select! {
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    break;
                }
            }
            _ = resize.recv() => {
                tokio::time::sleep(RESIZE_DEBOUNCE).await;
                let queried = lock_manager(&manager).size();
                if let Ok((width, height)) = queried {
                    let old = {
                        let mut state = lock_mode(&mode);
                        let old = state.size;
                        state.size = (width, height);
                        old
                    };
                    if old != (width, height) {
                        bus.publish_async(
                            Event::new(EVENT_RESIZED).with_payload(json!({
                                "width": width,
                                "height": height,
                                "oldWidth": old.0,
                                "oldHeight": old.1,
                            })),
                        );
                    }
                }
            }
            _ = interrupts.recv() => {
                let handler = lock_opt(&interrupt_handler).clone();
                if let Some(handler) = handler {
                    tokio::spawn(async move { handler() });
                }
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_nanos() as u64)
                    .unwrap_or(0);
                bus.publish_async(
                    Event::new(EVENT_INTERRUPTED).with_payload(json!({ "time": now })),
                );
            }
        }
    }
}
