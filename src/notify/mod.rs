//! High-level engine events pushed to operators.
//!
//! The engine only ever calls [`NotificationSink::notify`], which must not
//! block. Delivery, signing and provider fallback happen in the
//! [`dispatcher::NotificationDispatcher`] task.

pub mod dispatcher;
pub mod providers;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    GridShift,
    FillExecuted,
    DriftDetected,
    Degraded,
    OrderRejected,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NotificationKind::GridShift => "Grid Shift",
            NotificationKind::FillExecuted => "Fill Executed",
            NotificationKind::DriftDetected => "Drift Detected",
            NotificationKind::Degraded => "Engine Degraded",
            NotificationKind::OrderRejected => "Order Rejected",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub kind: NotificationKind,
    pub symbol: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn new(kind: NotificationKind, symbol: &str, payload: serde_json::Value) -> Self {
        Self {
            kind,
            symbol: symbol.to_string(),
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn title(&self) -> String {
        format!("[{}] {}", self.symbol, self.kind)
    }

    /// Plain-text body: one `key: value` line per payload field.
    pub fn content(&self) -> String {
        let mut lines = Vec::new();
        if let Some(fields) = self.payload.as_object() {
            for (key, value) in fields {
                let value = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                lines.push(format!("{}: {}", key, value));
            }
        } else if !self.payload.is_null() {
            lines.push(self.payload.to_string());
        }
        lines.push(format!(
            "time: {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
        ));
        lines.join("\n")
    }
}

pub trait NotificationSink: Send + Sync {
    /// Hands an event over for delivery. Never blocks.
    fn notify(&self, event: NotificationEvent);
}

/// Fans engine events out to every subscriber on a broadcast channel.
#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<NotificationEvent>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.tx.subscribe()
    }
}

impl NotificationSink for EventBroadcaster {
    fn notify(&self, event: NotificationEvent) {
        log::info!("[NOTIFY] {}", event.title());
        // Ignore error if there are no subscribers
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Sink that keeps every event for assertions.
    #[derive(Clone, Default)]
    pub struct RecordingSink {
        events: Arc<Mutex<Vec<NotificationEvent>>>,
    }

    impl RecordingSink {
        pub fn events(&self) -> Vec<NotificationEvent> {
            self.events.lock().unwrap().clone()
        }

        pub fn count(&self, kind: NotificationKind) -> usize {
            self.events().iter().filter(|e| e.kind == kind).count()
        }
    }

    impl NotificationSink for RecordingSink {
        fn notify(&self, event: NotificationEvent) {
            self.events.lock().unwrap().push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_rendering() {
        let event = NotificationEvent::new(
            NotificationKind::FillExecuted,
            "BNB/USDC",
            json!({"side": "Buy", "price": "540", "quantity": "0.01"}),
        );
        assert_eq!(event.title(), "[BNB/USDC] Fill Executed");
        let content = event.content();
        assert!(content.contains("side: Buy"));
        assert!(content.contains("price: 540"));
    }

    #[tokio::test]
    async fn test_broadcaster_delivers_to_subscribers() {
        let broadcaster = EventBroadcaster::new(8);
        let mut rx = broadcaster.subscribe();
        broadcaster.notify(NotificationEvent::new(
            NotificationKind::Degraded,
            "BNB/USDC",
            json!({"reason": "retry budget exhausted"}),
        ));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, NotificationKind::Degraded);
    }

    #[test]
    fn test_broadcaster_without_subscribers_does_not_fail() {
        let broadcaster = EventBroadcaster::new(8);
        broadcaster.notify(NotificationEvent::new(
            NotificationKind::GridShift,
            "BNB/USDC",
            serde_json::Value::Null,
        ));
    }
}
