//! Event delivery to the application.
//!
//! The bridge holds at most one listener. Emitting only enqueues, so it is
//! safe from hardware callback paths; a single delivery task invokes the
//! listener in emission order.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Lifecycle events reported to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A scan session ended: the lock's address, or `None` on timeout.
    ScanResult(Option<String>),
    /// The lock is connected and ready for commands.
    Connected,
    /// The connection is gone.
    Disconnected,
    /// The lock acknowledged the unlock write.
    WriteAck,
}

impl Event {
    /// The kind tag of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ScanResult(_) => EventKind::ScanResult,
            Self::Connected => EventKind::Connected,
            Self::Disconnected => EventKind::Disconnected,
            Self::WriteAck => EventKind::WriteAck,
        }
    }

    /// The optional value carried by the event.
    pub fn value(&self) -> Option<&str> {
        match self {
            Self::ScanResult(address) => address.as_deref(),
            _ => None,
        }
    }

    /// Flatten into the `{event, value}` record handed to applications.
    pub fn record(&self) -> EventRecord {
        EventRecord {
            event: self.kind(),
            value: self.value().map(str::to_owned),
        }
    }
}

/// Event kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EventKind {
    /// See [`Event::ScanResult`].
    #[cfg_attr(feature = "serde", serde(rename = "EVENT_SCAN_RESULT"))]
    ScanResult,
    /// See [`Event::Connected`].
    #[cfg_attr(feature = "serde", serde(rename = "EVENT_CONNECTED"))]
    Connected,
    /// See [`Event::Disconnected`].
    #[cfg_attr(feature = "serde", serde(rename = "EVENT_DISCONNECTED"))]
    Disconnected,
    /// See [`Event::WriteAck`].
    #[cfg_attr(feature = "serde", serde(rename = "EVENT_WRITE_ACK"))]
    WriteAck,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ScanResult => write!(f, "EVENT_SCAN_RESULT"),
            Self::Connected => write!(f, "EVENT_CONNECTED"),
            Self::Disconnected => write!(f, "EVENT_DISCONNECTED"),
            Self::WriteAck => write!(f, "EVENT_WRITE_ACK"),
        }
    }
}

/// Loosely typed event record.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EventRecord {
    /// Kind tag.
    pub event: EventKind,
    /// Device address for scan results, otherwise `None`.
    pub value: Option<String>,
}

/// Receiver of lifecycle events.
pub trait EventListener: Send + Sync + 'static {
    /// Called once per event, in emission order.
    fn on_event(&self, event: Event);
}

impl<F> EventListener for F
where
    F: Fn(Event) + Send + Sync + 'static,
{
    fn on_event(&self, event: Event) {
        self(event)
    }
}

struct Delivery {
    listener: Arc<dyn EventListener>,
    event: Event,
}

/// Single-listener event channel between the lock core and the application.
#[derive(Clone)]
pub struct EventBridge {
    listener: Arc<Mutex<Option<Arc<dyn EventListener>>>>,
    queue_tx: mpsc::UnboundedSender<Delivery>,
}

impl EventBridge {
    /// Create a bridge and spawn its delivery task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new() -> Self {
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<Delivery>();

        tokio::spawn(async move {
            while let Some(delivery) = queue_rx.recv().await {
                delivery.listener.on_event(delivery.event);
            }
            debug!("Event delivery task ended");
        });

        Self {
            listener: Arc::new(Mutex::new(None)),
            queue_tx,
        }
    }

    /// Register the listener, replacing any previous one.
    pub fn attach<L: EventListener>(&self, listener: L) {
        if self.listener.lock().replace(Arc::new(listener)).is_some() {
            debug!("Replaced event listener");
        }
    }

    /// Attach a channel-backed listener and return its receiving end.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.attach(move |event| {
            let _ = tx.send(event);
        });
        rx
    }

    /// Remove the listener. Later events are dropped.
    pub fn detach(&self) {
        self.listener.lock().take();
    }

    /// Whether a listener is attached.
    pub fn has_listener(&self) -> bool {
        self.listener.lock().is_some()
    }

    /// Queue an event for the current listener.
    pub fn emit(&self, event: Event) {
        let listener = self.listener.lock().clone();
        match listener {
            Some(listener) => {
                debug!("Emitting {}", event.kind());
                if self.queue_tx.send(Delivery { listener, event }).is_err() {
                    trace!("Delivery task gone, event dropped");
                }
            }
            None => trace!("No listener attached, dropping {}", event.kind()),
        }
    }
}

impl Default for EventBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBridge")
            .field("has_listener", &self.has_listener())
            .finish()
    }
}
