//! End-to-end wiring: components composed over the full service stack.
//!
//! Builds a miniature console application — a scrolling log view and a
//! status footer — and drives it through the runtime: bus events append
//! log lines, state mutations repaint the footer, input routes to the
//! focused component, and teardown restores the terminal.

#![allow(clippy::unwrap_used)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use conch_core::console::ConsoleBuffer;
use conch_core::layout::{LayoutManager, Region};
use conch_core::terminal::{TermCall, TestTerminal, TestTerminalHandle};
use conch_runtime::component::{Component, ComponentContext, Dependencies};
use conch_runtime::controller::TerminalController;
use conch_runtime::error::Result;
use conch_runtime::events::{Event, EventBus};
use conch_runtime::runtime::ComponentRuntime;
use conch_runtime::state::StateManager;

/// Scrolling log view over a [`ConsoleBuffer`], fed by `log.line` events.
struct LogView {
    id: String,
    region: Option<Region>,
    buffer: Arc<Mutex<ConsoleBuffer>>,
    deps: Option<Dependencies>,
    dirty: Arc<AtomicBool>,
    subscription: Option<u64>,
}

impl LogView {
    fn new() -> Self {
        Self {
            id: "log".into(),
            region: None,
            buffer: Arc::new(Mutex::new(ConsoleBuffer::new())),
            deps: None,
            dirty: Arc::new(AtomicBool::new(false)),
            subscription: None,
        }
    }
}

#[async_trait]
impl Component for LogView {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        "log-view"
    }

    async fn init(&mut self, _ctx: ComponentContext, deps: Dependencies) -> Result<()> {
        let region = Region::new("log", 0, 0, 40, 5);
        deps.layout.define_region(region.clone())?;
        self.region = Some(region);

        let buffer = Arc::clone(&self.buffer);
        let dirty = Arc::clone(&self.dirty);
        let (w, _) = deps.controller.size();
        if let Ok(mut buf) = buffer.lock() {
            buf.set_terminal_width(w as usize);
        }
        let id = deps.events.subscribe(
            "log.line",
            Arc::new(move |event: &Event| {
                if let Some(text) = event.payload.get("text").and_then(|v| v.as_str()) {
                    if let Ok(mut buf) = buffer.lock() {
                        buf.add_content(text);
                    }
                    dirty.store(true, Ordering::SeqCst);
                }
                Ok(())
            }),
        );
        self.subscription = Some(id);
        self.deps = Some(deps);
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    async fn cleanup(&mut self) -> Result<()> {
        if let (Some(deps), Some(id)) = (&self.deps, self.subscription.take()) {
            deps.events.unsubscribe(id);
        }
        Ok(())
    }

    fn render(&mut self) -> Result<()> {
        let deps = match &self.deps {
            Some(deps) => deps,
            None => return Ok(()),
        };
        let region = match &self.region {
            Some(region) => region.clone(),
            None => return Ok(()),
        };
        let lines: Vec<String> = match self.buffer.lock() {
            Ok(mut buf) => buf
                .get_visible_lines(region.height as usize)
                .iter()
                .map(|l| l.content.clone())
                .collect(),
            Err(_) => Vec::new(),
        };
        for (row, line) in lines.iter().enumerate() {
            deps.controller
                .write_at(region.x, region.y + row as u16, line.as_bytes())?;
        }
        self.dirty.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn needs_redraw(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    fn handle_input(&mut self, input: &[u8]) -> Result<bool> {
        // PageUp-style scrollback on 'k' / 'j'.
        let mut buf = match self.buffer.lock() {
            Ok(buf) => buf,
            Err(_) => return Ok(false),
        };
        match input {
            [b'k'] => {
                buf.scroll_up(1);
                self.dirty.store(true, Ordering::SeqCst);
                Ok(true)
            }
            [b'j'] => {
                buf.scroll_down(1);
                self.dirty.store(true, Ordering::SeqCst);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn can_handle_input(&self) -> bool {
        true
    }

    fn get_region(&self) -> Option<Region> {
        self.region.clone()
    }

    fn set_region(&mut self, region: Region) {
        self.region = Some(region);
    }
}

/// One-row footer mirroring `status.text` from the state store.
struct Footer {
    id: String,
    region: Option<Region>,
    deps: Option<Dependencies>,
    dirty: Arc<AtomicBool>,
}

impl Footer {
    fn new() -> Self {
        Self {
            id: "footer".into(),
            region: None,
            deps: None,
            dirty: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl Component for Footer {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        "footer"
    }

    async fn init(&mut self, _ctx: ComponentContext, deps: Dependencies) -> Result<()> {
        let region = Region::new("footer", 0, 5, 40, 1).with_z_order(10);
        deps.layout.define_region(region.clone())?;
        self.region = Some(region);

        let dirty = Arc::clone(&self.dirty);
        deps.state.subscribe(
            "status.*",
            Arc::new(move |_, _, _| {
                dirty.store(true, Ordering::SeqCst);
            }),
        );
        self.deps = Some(deps);
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    async fn cleanup(&mut self) -> Result<()> {
        Ok(())
    }

    fn render(&mut self) -> Result<()> {
        let deps = match &self.deps {
            Some(deps) => deps,
            None => return Ok(()),
        };
        let region = match &self.region {
            Some(region) => region.clone(),
            None => return Ok(()),
        };
        let text = deps
            .state
            .get("status.text")
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_default();
        deps.controller
            .write_at(region.x, region.y, text.as_bytes())?;
        self.dirty.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn needs_redraw(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    fn handle_input(&mut self, _input: &[u8]) -> Result<bool> {
        Ok(false)
    }

    fn get_region(&self) -> Option<Region> {
        self.region.clone()
    }

    fn set_region(&mut self, region: Region) {
        self.region = Some(region);
    }
}

struct Harness {
    runtime: Arc<ComponentRuntime>,
    bus: Arc<EventBus>,
    state: Arc<StateManager>,
    layout: Arc<LayoutManager>,
    term: TestTerminalHandle,
}

fn harness() -> Harness {
    let term = TestTerminal::new(40, 6);
    let handle = term.handle();
    let bus = Arc::new(EventBus::new());
    let controller = TerminalController::new(Box::new(term), Arc::clone(&bus));
    let layout = Arc::new(LayoutManager::new(40, 6));
    let state = Arc::new(StateManager::new());
    let runtime = ComponentRuntime::new(
        controller,
        Arc::clone(&layout),
        Arc::clone(&state),
        Arc::clone(&bus),
    );
    Harness {
        runtime,
        bus,
        state,
        layout,
        term: handle,
    }
}

async fn drive(runtime: &Arc<ComponentRuntime>, input: mpsc::Receiver<Vec<u8>>, ms: u64) {
    let rt = Arc::clone(runtime);
    let handle = tokio::spawn(async move { rt.run(input).await });
    tokio::time::sleep(Duration::from_millis(ms)).await;
    runtime.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn bus_events_reach_the_screen() {
    let h = harness();
    h.runtime.register(Box::new(LogView::new()), 0).await.unwrap();
    h.runtime.register(Box::new(Footer::new()), 1).await.unwrap();
    h.runtime.start().await.unwrap();

    h.state.set("status.text", json!("ready"));
    h.bus
        .publish(Event::new("log.line").with_payload(json!({ "text": "first entry" })))
        .unwrap();
    h.bus
        .publish(Event::new("log.line").with_payload(json!({ "text": "second entry" })))
        .unwrap();

    let (_tx, rx) = mpsc::channel(4);
    drive(&h.runtime, rx, 60).await;

    let output = h.term.output();
    assert!(output.contains("first entry"), "log missing: {output:?}");
    assert!(output.contains("second entry"), "log missing: {output:?}");
    assert!(output.contains("ready"), "footer missing: {output:?}");

    h.runtime.stop().await.unwrap();
    assert!(
        h.term.calls().iter().any(|c| matches!(c, TermCall::Cleanup)),
        "terminal restored on stop"
    );
}

#[tokio::test]
async fn input_scrolls_the_focused_view() {
    let h = harness();
    h.runtime.register(Box::new(LogView::new()), 0).await.unwrap();
    h.runtime.start().await.unwrap();

    for i in 0..10 {
        h.bus
            .publish(Event::new("log.line").with_payload(json!({ "text": format!("line {i}") })))
            .unwrap();
    }

    let (tx, rx) = mpsc::channel(4);
    tx.send(vec![b'k']).await.unwrap();
    drive(&h.runtime, rx, 60).await;

    // Scrolled one line back: the newest line is off-screen.
    let output = h.term.output();
    assert!(output.contains("line 8"), "{output:?}");
    assert!(!output.contains("line 9"), "{output:?}");
    h.runtime.stop().await.unwrap();
}

#[tokio::test]
async fn footer_repaints_on_state_change() {
    let h = harness();
    h.runtime.register(Box::new(Footer::new()), 0).await.unwrap();
    h.runtime.start().await.unwrap();

    let (_tx, rx) = mpsc::channel(4);
    h.state.set("status.text", json!("thinking"));
    drive(&h.runtime, rx, 60).await;
    assert!(h.term.output().contains("thinking"));

    h.term.reset();
    h.state.set("status.text", json!("idle"));
    let (_tx2, rx2) = mpsc::channel(4);
    drive(&h.runtime, rx2, 60).await;
    assert!(h.term.output().contains("idle"));

    h.runtime.stop().await.unwrap();
}

#[tokio::test]
async fn resize_event_recomputes_layout() {
    let h = harness();
    h.runtime.register(Box::new(LogView::new()), 0).await.unwrap();

    // Consumers recompute the layout when the controller announces a
    // new size.
    let layout = Arc::clone(&h.layout);
    h.bus.subscribe(
        "terminal.resized",
        Arc::new(move |event: &Event| {
            let w = event.payload.get("width").and_then(|v| v.as_u64()).unwrap_or(0) as u16;
            let hgt = event
                .payload
                .get("height")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u16;
            layout.calculate_layout(w, hgt);
            Ok(())
        }),
    );
    h.runtime.start().await.unwrap();

    h.bus
        .publish(
            Event::new("terminal.resized").with_payload(json!({
                "width": 100,
                "height": 30,
                "oldWidth": 40,
                "oldHeight": 6,
            })),
        )
        .unwrap();

    assert_eq!(h.layout.get_available_space(), (100, 30));
    // Every region is marked for repaint.
    assert_eq!(h.layout.dirty_regions(), vec!["log"]);

    h.runtime.stop().await.unwrap();
}

#[tokio::test]
async fn stop_is_idempotent_and_restores_terminal() {
    let h = harness();
    h.runtime.register(Box::new(LogView::new()), 0).await.unwrap();
    h.runtime.start().await.unwrap();
    h.runtime.stop().await.unwrap();
    h.runtime.stop().await.unwrap();
    assert!(!h.term.raw_mode());
}
