//! Process-wide event bus
//!
//! Three named events are published: `server_started`, `error_dropped` and
//! `cert_manager_action`. Subscribers receive every event published after
//! they subscribe; publishing never blocks.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const EVENT_BUS_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ServerStarted,
    ErrorDropped,
    CertManagerAction,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ServerStarted => "server_started",
            EventKind::ErrorDropped => "error_dropped",
            EventKind::CertManagerAction => "cert_manager_action",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    /// Publish an event; a bus with no subscribers swallows it.
    pub fn publish(
        &self,
        kind: EventKind,
        message: impl Into<String>,
        payload: serde_json::Map<String, serde_json::Value>,
    ) {
        let _ = self.tx.send(Event {
            kind,
            message: message.into(),
            payload,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Build an event payload map from string pairs.
pub fn payload<I, K, V>(entries: I) -> serde_json::Map<String, serde_json::Value>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<serde_json::Value>,
{
    entries
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
