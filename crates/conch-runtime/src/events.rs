//! Typed pub/sub event bus.
//!
//! Subscriptions match an exact event type, the wildcard `*`, or a
//! source tag (`_source_<s>`). Synchronous publish invokes handlers on
//! the calling task with the subscription table lock released; async
//! publish enqueues into a bounded queue drained by a single consumer
//! task and drops on overflow.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Result, RuntimeError};

/// Default capacity of the async publish queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Prefix that marks a subscription pattern as a source tag.
pub const SOURCE_PATTERN_PREFIX: &str = "_source_";

/// A bus message.
#[derive(Clone, Debug)]
pub struct Event {
    /// Bus-assigned sequence number.
    pub id: u64,
    /// Type tag, e.g. `terminal.resized`.
    pub event_type: String,
    /// Publishing component id, or empty.
    pub source: String,
    /// Addressed component id, if any.
    pub target: Option<String>,
    /// Opaque payload.
    pub payload: serde_json::Value,
    /// Nanoseconds since the epoch; assigned at publish when zero.
    pub timestamp_nanos: u128,
}

impl Event {
    /// Create an event of the given type with an empty payload.
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            id: 0,
            event_type: event_type.into(),
            source: String::new(),
            target: None,
            payload: serde_json::Value::Null,
            timestamp_nanos: 0,
        }
    }

    /// Builder-style source tag.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Builder-style target id.
    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Builder-style payload.
    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Handler invoked for each matching event.
pub type EventHandler = Arc<dyn Fn(&Event) -> Result<()> + Send + Sync>;

/// Predicate consulted before any dispatch.
pub type EventFilter = Box<dyn Fn(&Event) -> bool + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Eq)]
enum MatchRule {
    Type(String),
    Wildcard,
    Source(String),
}

impl MatchRule {
    fn parse(pattern: &str) -> Self {
        if pattern == "*" {
            MatchRule::Wildcard
        } else if let Some(source) = pattern.strip_prefix(SOURCE_PATTERN_PREFIX) {
            MatchRule::Source(source.to_string())
        } else {
            MatchRule::Type(pattern.to_string())
        }
    }
}

struct Subscription {
    id: u64,
    rule: MatchRule,
    handler: EventHandler,
}

#[derive(Default)]
struct SubTable {
    subs: Vec<Subscription>,
}

impl SubTable {
    /// Matching handlers in delivery order: by-type, wildcard, by-source.
    fn matching(&self, event: &Event) -> Vec<EventHandler> {
        let mut out = Vec::new();
        for sub in &self.subs {
            if let MatchRule::Type(t) = &sub.rule {
                if *t == event.event_type {
                    out.push(Arc::clone(&sub.handler));
                }
            }
        }
        for sub in &self.subs {
            if sub.rule == MatchRule::Wildcard {
                out.push(Arc::clone(&sub.handler));
            }
        }
        for sub in &self.subs {
            if let MatchRule::Source(s) = &sub.rule {
                if !event.source.is_empty() && *s == event.source {
                    out.push(Arc::clone(&sub.handler));
                }
            }
        }
        out
    }
}

/// Typed pub/sub bus with sync and queued-async delivery.
pub struct EventBus {
    table: Arc<RwLock<SubTable>>,
    filter: Arc<RwLock<Option<EventFilter>>>,
    next_sub_id: AtomicU64,
    next_event_id: Arc<AtomicU64>,
    queue_tx: Mutex<Option<mpsc::Sender<Event>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    capacity: usize,
}

impl EventBus {
    /// Create a bus with the default async queue capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Create a bus with an explicit async queue capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            table: Arc::new(RwLock::new(SubTable::default())),
            filter: Arc::new(RwLock::new(None)),
            next_sub_id: AtomicU64::new(1),
            next_event_id: Arc::new(AtomicU64::new(1)),
            queue_tx: Mutex::new(None),
            consumer: Mutex::new(None),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe with a pattern: an exact type, `*`, or `_source_<s>`.
    ///
    /// Returns the subscription id for [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe(&self, pattern: &str, handler: EventHandler) -> u64 {
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let sub = Subscription {
            id,
            rule: MatchRule::parse(pattern),
            handler,
        };
        if let Ok(mut table) = self.table.write() {
            table.subs.push(sub);
        }
        id
    }

    /// Remove a subscription; returns whether it existed.
    pub fn unsubscribe(&self, id: u64) -> bool {
        match self.table.write() {
            Ok(mut table) => {
                let before = table.subs.len();
                table.subs.retain(|s| s.id != id);
                table.subs.len() != before
            }
            Err(_) => false,
        }
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.table.read().map(|t| t.subs.len()).unwrap_or(0)
    }

    /// Install (or clear) the pre-dispatch filter predicate.
    pub fn set_filter(&self, filter: Option<EventFilter>) {
        if let Ok(mut slot) = self.filter.write() {
            *slot = filter;
        }
    }

    fn stamp(next_event_id: &AtomicU64, event: &mut Event) {
        event.id = next_event_id.fetch_add(1, Ordering::Relaxed);
        if event.timestamp_nanos == 0 {
            event.timestamp_nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0);
        }
    }

    /// Deliver synchronously on the calling task.
    ///
    /// All matching handlers run; the first handler error is returned.
    pub fn publish(&self, mut event: Event) -> Result<()> {
        Self::stamp(&self.next_event_id, &mut event);
        deliver(&self.table, &self.filter, &event)
    }

    /// Enqueue for the consumer task; drops with a warning when the
    /// queue is full or the bus is not started.
    pub fn publish_async(&self, mut event: Event) {
        Self::stamp(&self.next_event_id, &mut event);
        let guard = match self.queue_tx.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        match guard.as_ref() {
            Some(tx) => {
                if let Err(e) = tx.try_send(event) {
                    tracing::warn!("event queue full, dropping event: {e}");
                }
            }
            None => {
                tracing::warn!("event bus not started, dropping async event");
            }
        }
    }

    /// Spawn the consumer task draining the async queue.
    pub fn start(&self) {
        let mut tx_slot = match self.queue_tx.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        if tx_slot.is_some() {
            return;
        }
        let (tx, mut rx) = mpsc::channel::<Event>(self.capacity);
        *tx_slot = Some(tx);

        let table = Arc::clone(&self.table);
        let filter = Arc::clone(&self.filter);
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                // Async delivery ignores handler errors.
                if let Err(e) = deliver(&table, &filter, &event) {
                    tracing::debug!("async event handler error: {e}");
                }
            }
        });
        if let Ok(mut consumer) = self.consumer.lock() {
            *consumer = Some(handle);
        }
    }

    /// Close the queue and wait for the consumer to drain.
    pub async fn stop(&self) {
        if let Ok(mut tx_slot) = self.queue_tx.lock() {
            tx_slot.take();
        }
        let handle = match self.consumer.lock() {
            Ok(mut consumer) => consumer.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn deliver(
    table: &RwLock<SubTable>,
    filter: &RwLock<Option<EventFilter>>,
    event: &Event,
) -> Result<()> {
    if let Ok(filter) = filter.read() {
        if let Some(predicate) = filter.as_ref() {
            if !predicate(event) {
                return Ok(());
            }
        }
    }

    let handlers = match table.read() {
        Ok(table) => table.matching(event),
        Err(_) => return Err(RuntimeError::Handler("subscription table poisoned".into())),
    };

    // Lock released before any handler runs.
    let mut first_err = None;
    for handler in handlers {
        if let Err(e) = handler(event) {
            if first_err.is_none() {
                first_err = Some(e);
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
