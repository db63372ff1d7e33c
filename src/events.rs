//! In-process event bus.
//!
//! Messages are produced by:
//! - the dispatch loop (input transitions, state changes, audit events)
//! - the device lifecycle (`DeviceStopped` sentinel)
//! - other devices (global interlock and config broadcasts)
//!
//! and consumed by subscribers that each own an unbounded queue, so a
//! publisher never blocks and every subscriber sees its topic in publish
//! order.
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌──────────────────┐
//! │ Dispatch    │────▶│              │────▶│ on(): audit log  │
//! │ Lifecycle   │────▶│  Bus (topic  │────▶│ on(): global sig │
//! │ Peer device │────▶│   → queues)  │────▶│ API observers    │
//! └─────────────┘     └──────────────┘     └──────────────────┘
//! ```
//!
//! [`on`] ties a subscription to a device [`Scope`]: the handler task ends
//! when the device's own bus carries `DeviceStopped` or the scope is
//! cancelled, so repeated start/stop cycles never accumulate tasks.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use log::debug;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::app::events::Event;
use crate::fsm::context::DeviceState;
use crate::pins::InputRole;

// ═══════════════════════════════════════════════════════════════
//  Topics and payloads
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Debounced input level change read from the board.
    Input,
    /// Snapshot after every state mutation.
    StateChanged,
    /// Audit event to be appended to the event log.
    Audit,
    /// Sentinel: the device is stopping.
    DeviceStopped,
    /// Cross-device broadcast.
    Global,
}

/// A level change on a bound input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputEvent {
    pub role: InputRole,
    pub pin: u8,
    /// Logical level after active-low correction.
    pub active: bool,
}

/// Process-wide signals exchanged between devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalSignal {
    EmergencyStop { origin: String, active: bool },
    Security { origin: String, active: bool },
    ConfigChanged { device: String, version: u64 },
}

impl GlobalSignal {
    pub fn origin(&self) -> &str {
        match self {
            Self::EmergencyStop { origin, .. } | Self::Security { origin, .. } => origin,
            Self::ConfigChanged { device, .. } => device,
        }
    }
}

/// Tagged payload; the variant determines the topic.
#[derive(Debug, Clone)]
pub enum Message {
    Input(InputEvent),
    StateChanged(Arc<DeviceState>),
    Audit(Event),
    DeviceStopped { device: String },
    Global(GlobalSignal),
}

impl Message {
    pub fn topic(&self) -> Topic {
        match self {
            Self::Input(_) => Topic::Input,
            Self::StateChanged(_) => Topic::StateChanged,
            Self::Audit(_) => Topic::Audit,
            Self::DeviceStopped { .. } => Topic::DeviceStopped,
            Self::Global(_) => Topic::Global,
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Bus
// ═══════════════════════════════════════════════════════════════

struct Slot {
    id: u64,
    tx: mpsc::UnboundedSender<Message>,
}

struct BusInner {
    name: String,
    next_id: AtomicU64,
    topics: Mutex<HashMap<Topic, Vec<Slot>>>,
}

impl BusInner {
    fn remove(&self, topic: Topic, id: u64) {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slots) = topics.get_mut(&topic) {
            slots.retain(|s| s.id != id);
        }
    }
}

/// Cheaply cloneable handle to one bus.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus").field("name", &self.inner.name).finish()
    }
}

impl Bus {
    pub fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(BusInner {
                name: name.to_owned(),
                next_id: AtomicU64::new(1),
                topics: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Fan `msg` out to every current subscriber of its topic.
    /// Never blocks; subscribers whose receiver is gone are pruned.
    pub fn publish(&self, msg: Message) {
        let topic = msg.topic();
        let mut topics = self.inner.topics.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slots) = topics.get_mut(&topic) {
            slots.retain(|s| s.tx.send(msg.clone()).is_ok());
        }
    }

    /// Start receiving `topic`.  Only messages published after this call
    /// are delivered.
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic)
            .or_default()
            .push(Slot { id, tx });
        Subscription {
            topic,
            id,
            rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Number of live subscriptions to `topic`.
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.inner
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&topic)
            .map_or(0, Vec::len)
    }
}

/// Receiving end of one topic.  Dropping it unsubscribes.
pub struct Subscription {
    topic: Topic,
    id: u64,
    rx: mpsc::UnboundedReceiver<Message>,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Next message, or `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    /// Detach from the bus.  Messages already queued are discarded.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.rx.close();
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.topic, self.id);
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Lifecycle scope
// ═══════════════════════════════════════════════════════════════

/// Lifecycle token of one device run.
///
/// Every background task of a run is spawned through its scope: the tasks
/// are counted by the device-wide [`TaskTracker`] and all of them end when
/// the scope is cancelled.
#[derive(Clone, Debug)]
pub struct Scope {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl Scope {
    pub fn new(tracker: TaskTracker) -> Self {
        Self {
            token: CancellationToken::new(),
            tracker,
        }
    }

    /// Spawn `fut`, tracked and cancelled with the scope.
    pub fn spawn<F>(&self, name: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                () = token.cancelled() => debug!("task {name} cancelled"),
                () = fut => debug!("task {name} finished"),
            }
        });
    }

    /// Spawn a tracked task that watches [`Scope::cancelled`] itself, so it
    /// is never dropped halfway through a step.
    pub fn spawn_cooperative<F>(&self, name: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(async move {
            fut.await;
            debug!("task {name} finished");
        });
    }

    /// A token cancelled with the scope that can also be cancelled alone.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

/// Apply `handler` to every `topic` message on `source` until the device
/// stops.
///
/// Exactly one task is spawned.  It ends when `device_bus` carries
/// [`Message::DeviceStopped`] or `scope` is cancelled, and drops its
/// subscription to `source` on the way out.  Both subscriptions are taken
/// before this returns, so nothing published afterwards is missed.
pub fn on<F, Fut>(scope: &Scope, device_bus: &Bus, source: &Bus, topic: Topic, mut handler: F)
where
    F: FnMut(Message) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut events = source.subscribe(topic);
    let mut stopped = device_bus.subscribe(Topic::DeviceStopped);
    let label = format!("{}:{topic:?}", source.name());
    scope.spawn("on", async move {
        loop {
            tokio::select! {
                biased;
                _ = stopped.recv() => break,
                msg = events.recv() => match msg {
                    Some(msg) => handler(msg).await,
                    None => break,
                },
            }
        }
        events.unsubscribe();
        debug!("on({label}) unwound");
    });
}
