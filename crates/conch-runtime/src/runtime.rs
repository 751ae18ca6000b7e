//! Component registry and main loop.
//!
//! The runtime owns the services (controller, layout, state, bus),
//! keeps the component registry stably sorted by registration order,
//! routes input bytes — honoring exclusive leases arbitrated over the
//! bus — and repaints dirty components in layout render order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, watch};

use conch_core::layout::LayoutManager;

use crate::component::{Component, ComponentContext, Dependencies};
use crate::controller::TerminalController;
use crate::error::{Result, RuntimeError};
use crate::events::{Event, EventBus};
use crate::state::StateManager;

/// Event type a component publishes to request an exclusive input lease.
pub const EVENT_REQUEST_EXCLUSIVE: &str = "input.request_exclusive";
/// Event type a holder publishes to release its lease.
pub const EVENT_RELEASE_EXCLUSIVE: &str = "input.release_exclusive";
/// Published when a lease request is granted.
pub const EVENT_EXCLUSIVE_GRANTED: &str = "input.exclusive_granted";
/// Published when a lease request is denied.
pub const EVENT_EXCLUSIVE_DENIED: &str = "input.exclusive_denied";

/// Idle tick between main-loop cycles.
const LOOP_IDLE: Duration = Duration::from_millis(10);

struct Entry {
    id: String,
    order: i32,
    component: Box<dyn Component>,
}

/// Host for registered components.
pub struct ComponentRuntime {
    controller: Arc<TerminalController>,
    layout: Arc<LayoutManager>,
    state: Arc<StateManager>,
    bus: Arc<EventBus>,
    components: tokio::sync::Mutex<Vec<Entry>>,
    started: AtomicBool,
    exclusive: Arc<StdMutex<Option<String>>>,
    cancel: watch::Sender<bool>,
}

impl ComponentRuntime {
    /// Assemble a runtime over the given services.
    pub fn new(
        controller: Arc<TerminalController>,
        layout: Arc<LayoutManager>,
        state: Arc<StateManager>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        let (cancel, _) = watch::channel(false);
        Arc::new(Self {
            controller,
            layout,
            state,
            bus,
            components: tokio::sync::Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            exclusive: Arc::new(StdMutex::new(None)),
            cancel,
        })
    }

    /// The service bundle components receive at `init`.
    pub fn dependencies(&self) -> Dependencies {
        Dependencies {
            controller: Arc::clone(&self.controller),
            layout: Arc::clone(&self.layout),
            state: Arc::clone(&self.state),
            events: Arc::clone(&self.bus),
        }
    }

    /// Register a component at the given order.
    ///
    /// The registry stays stably sorted ascending by order; equal
    /// orders keep registration sequence. Fails once started or on a
    /// duplicate id.
    pub async fn register(&self, component: Box<dyn Component>, order: i32) -> Result<()> {
        if self.started.load(Ordering::SeqCst) {
            return Err(RuntimeError::Lifecycle(
                "cannot register components while the runtime is started".into(),
            ));
        }
        let id = component.id().to_string();
        let mut components = self.components.lock().await;
        if components.iter().any(|e| e.id == id) {
            return Err(RuntimeError::Lifecycle(format!(
                "component '{id}' is already registered"
            )));
        }
        let insert_at = components
            .iter()
            .position(|e| e.order > order)
            .unwrap_or(components.len());
        components.insert(
            insert_at,
            Entry {
                id,
                order,
                component,
            },
        );
        Ok(())
    }

    /// Registered component ids in routing order.
    pub async fn component_ids(&self) -> Vec<String> {
        self.components
            .lock()
            .await
            .iter()
            .map(|e| e.id.clone())
            .collect()
    }

    /// Current exclusive-lease holder, if any.
    pub fn exclusive_holder(&self) -> Option<String> {
        self.exclusive.lock().ok().and_then(|g| g.clone())
    }

    /// Initialize and start every component, the bus, and the
    /// controller tasks.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(RuntimeError::Lifecycle("runtime already started".into()));
        }

        self.bus.start();
        self.subscribe_lease_arbitration();
        self.controller.init()?;
        let (w, h) = self.controller.size();
        self.layout.calculate_layout(w, h);

        let deps = self.dependencies();
        let mut components = self.components.lock().await;
        for entry in components.iter_mut() {
            let ctx = ComponentContext {
                id: entry.id.clone(),
            };
            entry.component.init(ctx, deps.clone()).await?;
        }
        for entry in components.iter_mut() {
            entry.component.start().await?;
            tracing::debug!(component = %entry.id, "component started");
        }
        Ok(())
    }

    /// Stop and clean up components (reverse order), then the bus and
    /// the controller.
    pub async fn stop(&self) -> Result<()> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.cancel.send(true);

        let mut first_err: Option<RuntimeError> = None;
        {
            let mut components = self.components.lock().await;
            for entry in components.iter_mut().rev() {
                if let Err(e) = entry.component.stop().await {
                    tracing::warn!(component = %entry.id, "stop failed: {e}");
                    first_err.get_or_insert(e);
                }
            }
            for entry in components.iter_mut().rev() {
                if let Err(e) = entry.component.cleanup().await {
                    tracing::warn!(component = %entry.id, "cleanup failed: {e}");
                    first_err.get_or_insert(e);
                }
            }
        }

        self.bus.stop().await;
        if let Err(e) = self.controller.cleanup().await {
            first_err.get_or_insert(e);
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Request the main loop to exit.
    pub fn shutdown(&self) {
        let _ = self.cancel.send(true);
    }

    /// Main loop: poll input, route bytes, repaint dirty components.
    ///
    /// Returns when cancelled ([`shutdown`](Self::shutdown)) or the
    /// input stream closes.
    pub async fn run(&self, mut input: mpsc::Receiver<Vec<u8>>) -> Result<()> {
        // A previous shutdown only ends the run it targeted.
        let _ = self.cancel.send(false);
        let mut cancel = self.cancel.subscribe();
        loop {
            if *cancel.borrow() {
                break;
            }

            match input.try_recv() {
                Ok(chunk) => {
                    for &byte in &chunk {
                        self.route_byte(byte).await;
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => {}
                Err(mpsc::error::TryRecvError::Disconnected) => break,
            }

            self.render_dirty().await;

            tokio::select! {
                _ = cancel.changed() => {}
                _ = tokio::time::sleep(LOOP_IDLE) => {}
            }
        }
        Ok(())
    }

    /// Offer one byte: the lease holder sees it alone, otherwise the
    /// first accepting component consumes it.
    async fn route_byte(&self, byte: u8) {
        let holder = self.exclusive_holder();
        let mut components = self.components.lock().await;

        if let Some(holder) = holder {
            if let Some(entry) = components.iter_mut().find(|e| e.id == holder) {
                if let Err(e) = entry.component.handle_input(&[byte]) {
                    tracing::warn!(component = %holder, "input handler failed: {e}");
                }
            }
            return;
        }

        for entry in components.iter_mut() {
            if !entry.component.can_handle_input() {
                continue;
            }
            match entry.component.handle_input(&[byte]) {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(component = %entry.id, "input handler failed: {e}");
                }
            }
        }
    }

    /// Render dirty components inside a layout batch, in region render
    /// order, then components without a region.
    async fn render_dirty(&self) {
        let mut components = self.components.lock().await;
        if !components.iter().any(|e| e.component.needs_redraw()) {
            return;
        }

        self.layout.begin_batch();
        let order = self.layout.get_render_order();
        for name in &order {
            for entry in components.iter_mut() {
                let in_region = entry
                    .component
                    .get_region()
                    .is_some_and(|r| r.name == *name);
                if in_region && entry.component.needs_redraw() {
                    if let Err(e) = entry.component.render() {
                        tracing::error!("Render error in {}: {e}", entry.component.kind());
                    }
                }
            }
        }
        for entry in components.iter_mut() {
            if entry.component.get_region().is_none() && entry.component.needs_redraw() {
                if let Err(e) = entry.component.render() {
                    tracing::error!("Render error in {}: {e}", entry.component.kind());
                }
            }
        }
        self.layout.end_batch();
        drop(components);
        let _ = self.controller.flush().await;
    }

    /// Wire the lease request/release protocol onto the bus.
    fn subscribe_lease_arbitration(&self) {
        let exclusive = Arc::clone(&self.exclusive);
        let bus = Arc::clone(&self.bus);
        self.bus.subscribe(
            EVENT_REQUEST_EXCLUSIVE,
            Arc::new(move |event: &Event| {
                let requester = event.source.clone();
                if requester.is_empty() {
                    return Ok(());
                }
                let granted = {
                    let mut holder = match exclusive.lock() {
                        Ok(holder) => holder,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    match holder.as_ref() {
                        None => {
                            *holder = Some(requester.clone());
                            None
                        }
                        Some(existing) => Some(existing.clone()),
                    }
                };
                match granted {
                    None => bus.publish_async(
                        Event::new(EVENT_EXCLUSIVE_GRANTED)
                            .with_payload(json!({ "component": requester })),
                    ),
                    Some(existing) => bus.publish_async(
                        Event::new(EVENT_EXCLUSIVE_DENIED)
                            .with_payload(json!({ "component": requester, "holder": existing })),
                    ),
                }
                Ok(())
            }),
        );

        let exclusive = Arc::clone(&self.exclusive);
        self.bus.subscribe(
            EVENT_RELEASE_EXCLUSIVE,
            Arc::new(move |event: &Event| {
                let mut holder = match exclusive.lock() {
                    Ok(holder) => holder,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if holder.as_deref() == Some(event.source.as_str()) {
                    *holder = None;
                }
                Ok(())
            }),
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use conch_core::layout::Region;
    use conch_core::terminal::TestTerminal;
    use std::sync::atomic::AtomicUsize;

    struct Probe {
        id: String,
        region: Option<Region>,
        accepts_input: bool,
        consumed: Arc<StdMutex<Vec<u8>>>,
        started: Arc<AtomicBool>,
        renders: Arc<AtomicUsize>,
        dirty: Arc<AtomicBool>,
    }

    impl Probe {
        fn new(id: &str) -> Self {
            Self {
                id: id.to_string(),
                region: None,
                accepts_input: true,
                consumed: Arc::new(StdMutex::new(Vec::new())),
                started: Arc::new(AtomicBool::new(false)),
                renders: Arc::new(AtomicUsize::new(0)),
                dirty: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait::async_trait]
    impl Component for Probe {
        fn id(&self) -> &str {
            &self.id
        }

        fn kind(&self) -> &str {
            "probe"
        }

        async fn init(&mut self, _ctx: ComponentContext, _deps: Dependencies) -> Result<()> {
            Ok(())
        }

        async fn start(&mut self) -> Result<()> {
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&mut self) -> Result<()> {
            self.started.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn cleanup(&mut self) -> Result<()> {
            Ok(())
        }

        fn render(&mut self) -> Result<()> {
            self.renders.fetch_add(1, Ordering::SeqCst);
            self.dirty.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn needs_redraw(&self) -> bool {
            self.dirty.load(Ordering::SeqCst)
        }

        fn handle_input(&mut self, input: &[u8]) -> Result<bool> {
            if let Ok(mut consumed) = self.consumed.lock() {
                consumed.extend_from_slice(input);
            }
            Ok(true)
        }

        fn can_handle_input(&self) -> bool {
            self.accepts_input
        }

        fn get_region(&self) -> Option<Region> {
            self.region.clone()
        }

        fn set_region(&mut self, region: Region) {
            self.region = Some(region);
        }
    }

    fn runtime() -> Arc<ComponentRuntime> {
        let term = TestTerminal::new(80, 24);
        let bus = Arc::new(EventBus::new());
        let controller = TerminalController::new(Box::new(term), Arc::clone(&bus));
        ComponentRuntime::new(
            controller,
            Arc::new(LayoutManager::new(80, 24)),
            Arc::new(StateManager::new()),
            bus,
        )
    }

    #[tokio::test]
    async fn register_orders_stably() {
        let rt = runtime();
        rt.register(Box::new(Probe::new("late")), 10).await.unwrap();
        rt.register(Box::new(Probe::new("early")), 1).await.unwrap();
        rt.register(Box::new(Probe::new("tie")), 10).await.unwrap();
        assert_eq!(rt.component_ids().await, vec!["early", "late", "tie"]);
    }

    #[tokio::test]
    async fn duplicate_id_rejected() {
        let rt = runtime();
        rt.register(Box::new(Probe::new("x")), 0).await.unwrap();
        let err = rt.register(Box::new(Probe::new("x")), 0).await.unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[tokio::test]
    async fn register_while_started_rejected() {
        let rt = runtime();
        rt.start().await.unwrap();
        let err = rt.register(Box::new(Probe::new("x")), 0).await.unwrap_err();
        assert!(err.to_string().contains("while the runtime is started"));
        rt.stop().await.unwrap();
    }

    #[tokio::test]
    async fn start_and_stop_components() {
        let rt = runtime();
        let probe = Probe::new("p");
        let started = Arc::clone(&probe.started);
        rt.register(Box::new(probe), 0).await.unwrap();

        rt.start().await.unwrap();
        assert!(started.load(Ordering::SeqCst));
        rt.stop().await.unwrap();
        assert!(!started.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn double_start_rejected() {
        let rt = runtime();
        rt.start().await.unwrap();
        assert!(rt.start().await.is_err());
        rt.stop().await.unwrap();
    }

    #[tokio::test]
    async fn first_accepting_component_consumes() {
        let rt = runtime();
        let mut deaf = Probe::new("deaf");
        deaf.accepts_input = false;
        let deaf_bytes = Arc::clone(&deaf.consumed);
        let hearer = Probe::new("hearer");
        let hearer_bytes = Arc::clone(&hearer.consumed);
        let shadowed = Probe::new("shadowed");
        let shadowed_bytes = Arc::clone(&shadowed.consumed);

        rt.register(Box::new(deaf), 0).await.unwrap();
        rt.register(Box::new(hearer), 1).await.unwrap();
        rt.register(Box::new(shadowed), 2).await.unwrap();

        rt.route_byte(b'k').await;
        assert!(deaf_bytes.lock().unwrap().is_empty());
        assert_eq!(*hearer_bytes.lock().unwrap(), vec![b'k']);
        assert!(shadowed_bytes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn exclusive_lease_routes_to_holder() {
        let rt = runtime();
        let first = Probe::new("first");
        let first_bytes = Arc::clone(&first.consumed);
        let holder = Probe::new("holder");
        let holder_bytes = Arc::clone(&holder.consumed);
        rt.register(Box::new(first), 0).await.unwrap();
        rt.register(Box::new(holder), 1).await.unwrap();
        rt.start().await.unwrap();

        rt.bus
            .publish(Event::new(EVENT_REQUEST_EXCLUSIVE).with_source("holder"))
            .unwrap();
        assert_eq!(rt.exclusive_holder().as_deref(), Some("holder"));

        rt.route_byte(b'z').await;
        assert!(first_bytes.lock().unwrap().is_empty());
        assert_eq!(*holder_bytes.lock().unwrap(), vec![b'z']);

        // A competing request is denied while held.
        rt.bus
            .publish(Event::new(EVENT_REQUEST_EXCLUSIVE).with_source("first"))
            .unwrap();
        assert_eq!(rt.exclusive_holder().as_deref(), Some("holder"));

        // Only the holder can release.
        rt.bus
            .publish(Event::new(EVENT_RELEASE_EXCLUSIVE).with_source("first"))
            .unwrap();
        assert_eq!(rt.exclusive_holder().as_deref(), Some("holder"));
        rt.bus
            .publish(Event::new(EVENT_RELEASE_EXCLUSIVE).with_source("holder"))
            .unwrap();
        assert_eq!(rt.exclusive_holder(), None);

        rt.stop().await.unwrap();
    }

    #[tokio::test]
    async fn dirty_components_render_in_region_order() {
        let rt = runtime();
        rt.layout
            .define_region(Region::new("top", 0, 0, 80, 1).with_z_order(5))
            .unwrap();
        rt.layout
            .define_region(Region::new("base", 0, 1, 80, 23).with_z_order(0))
            .unwrap();

        let mut a = Probe::new("a");
        a.set_region(Region::new("top", 0, 0, 80, 1));
        let a_renders = Arc::clone(&a.renders);
        a.dirty.store(true, Ordering::SeqCst);
        let mut b = Probe::new("b");
        b.set_region(Region::new("base", 0, 1, 80, 23));
        let b_renders = Arc::clone(&b.renders);
        b.dirty.store(true, Ordering::SeqCst);

        rt.register(Box::new(a), 0).await.unwrap();
        rt.register(Box::new(b), 1).await.unwrap();

        rt.render_dirty().await;
        assert_eq!(a_renders.load(Ordering::SeqCst), 1);
        assert_eq!(b_renders.load(Ordering::SeqCst), 1);

        // Clean components are not repainted.
        rt.render_dirty().await;
        assert_eq!(a_renders.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_exits_on_shutdown() {
        let rt = runtime();
        let (_tx, rx) = mpsc::channel(4);
        let rt_clone = Arc::clone(&rt);
        let handle = tokio::spawn(async move { rt_clone.run(rx).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        rt.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn run_routes_input_chunks() {
        let rt = runtime();
        let probe = Probe::new("p");
        let bytes = Arc::clone(&probe.consumed);
        rt.register(Box::new(probe), 0).await.unwrap();

        let (tx, rx) = mpsc::channel(4);
        let rt_clone = Arc::clone(&rt);
        let handle = tokio::spawn(async move { rt_clone.run(rx).await });
        tx.send(vec![b'a', b'b']).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        rt.shutdown();
        handle.await.unwrap().unwrap();
        assert_eq!(*bytes.lock().unwrap(), vec![b'a', b'b']);
    }
}
