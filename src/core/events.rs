//! Connector lifecycle events
//!
//! A connector receives its sink at construction; there is no process-wide
//! logger. Sinks must not block: they are called from inside connector
//! transitions.

use super::transport::TransportKind;
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::Arc;
use tokio::sync::broadcast;

/// What happened
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum LifecycleEvent {
    /// Channel handed to the caller
    Opened,
    /// Caller-side retry after `DeviceBusy`
    BusyRetry {
        /// Attempt about to be made (1-based)
        attempt: u32,
        /// Backoff before that attempt
        delay_ms: u64,
        /// Holder reported by the failed attempt
        holder: String,
    },
    /// This connector displaced another holder of the line
    ForcedTakeover {
        /// Displaced holder
        previous_holder: String,
    },
    /// Teardown finished
    Closed,
    /// Handshake or session failure
    Failed {
        /// Human readable reason
        reason: String,
    },
}

impl LifecycleEvent {
    /// Short event name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Opened => "opened",
            Self::BusyRetry { .. } => "busy-retry",
            Self::ForcedTakeover { .. } => "forced-takeover",
            Self::Closed => "closed",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Event with its origin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorEvent {
    /// When it was emitted
    pub timestamp: DateTime<Local>,
    /// Transport variant
    pub transport: TransportKind,
    /// Resource identifier
    pub resource: String,
    /// Event payload
    #[serde(flatten)]
    pub event: LifecycleEvent,
}

/// Receiver of lifecycle events
#[cfg_attr(test, mockall::automock)]
pub trait EventSink: Send + Sync {
    /// Handle one event
    fn emit(&self, event: &ConnectorEvent);
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &ConnectorEvent) {}
}

/// Writes events as structured `tracing` records
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &ConnectorEvent) {
        let transport = event.transport;
        let resource = event.resource.as_str();
        match &event.event {
            LifecycleEvent::Failed { reason } => {
                tracing::warn!(%transport, resource, reason = %reason, "connector failed");
            }
            LifecycleEvent::ForcedTakeover { previous_holder } => {
                tracing::warn!(%transport, resource, previous_holder = %previous_holder, "forced takeover");
            }
            LifecycleEvent::BusyRetry {
                attempt,
                delay_ms,
                holder,
            } => {
                tracing::info!(%transport, resource, attempt, delay_ms, holder = %holder, "device busy, retrying");
            }
            other => {
                tracing::info!(%transport, resource, event = other.name(), "connector {}", other.name());
            }
        }
    }
}

/// Fans events out to tokio broadcast subscribers
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<ConnectorEvent>,
}

impl BroadcastSink {
    /// Create a sink buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectorEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: &ConnectorEvent) {
        // no subscribers is fine
        let _ = self.tx.send(event.clone());
    }
}

/// Serializes each event as one JSON line
pub struct JsonLinesSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    /// Wrap a writer
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Recover the writer
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl<W: Write + Send> EventSink for JsonLinesSink<W> {
    fn emit(&self, event: &ConnectorEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!("Failed to serialize connector event: {}", e);
                return;
            }
        };
        let mut writer = self.writer.lock();
        if let Err(e) = writeln!(writer, "{line}").and_then(|()| writer.flush()) {
            tracing::error!("Failed to write connector event: {}", e);
        }
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<ConnectorEvent>>,
}

impl MemorySink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything received so far
    pub fn events(&self) -> Vec<ConnectorEvent> {
        self.events.lock().clone()
    }

    /// Event names in order
    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|e| e.event.name()).collect()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &ConnectorEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Sink bound to one connector's transport and resource
#[derive(Clone)]
pub struct EventEmitter {
    sink: Arc<dyn EventSink>,
    transport: TransportKind,
    resource: String,
}

impl EventEmitter {
    /// Bind `sink` to an origin
    pub fn new(sink: Arc<dyn EventSink>, transport: TransportKind, resource: impl Into<String>) -> Self {
        Self {
            sink,
            transport,
            resource: resource.into(),
        }
    }

    /// Emit `event` stamped with the current time
    pub fn emit(&self, event: LifecycleEvent) {
        self.sink.emit(&ConnectorEvent {
            timestamp: Local::now(),
            transport: self.transport,
            resource: self.resource.clone(),
            event,
        });
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("transport", &self.transport)
            .field("resource", &self.resource)
            .finish_non_exhaustive()
    }
}
