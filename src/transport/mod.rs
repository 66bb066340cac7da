//! Transport & Channel Registry (spec §4.1): WebSocket upgrade, a registry
//! of connected widget/dashboard clients, and best-effort fan-out to them.
//! Grounded on the teacher's `main.rs` `websocket_handler`/`handle_socket`/
//! `AppState.signal_broadcast` — a `broadcast::Sender` fanned out to many
//! reader tasks, generalized here to two distinct channel kinds plus a
//! per-session widget mapping the teacher didn't need.

use crate::decision::InterventionBroadcaster;
use crate::models::{Id, Intervention};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Widget,
    Dashboard,
}

/// Inbound widget frame shapes (spec §6.1).
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WidgetFrame {
    Track {
        #[serde(flatten)]
        body: Value,
    },
    Ping,
    InterventionOutcome {
        #[serde(rename = "interventionId")]
        intervention_id: Id,
        status: String,
        #[serde(rename = "conversionAction")]
        conversion_action: Option<String>,
    },
}

/// Inbound dashboard frame shapes (spec §6.1).
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DashboardFrame {
    SelectSession {
        #[serde(rename = "sessionId")]
        session_id: Id,
    },
    TuneWeights {
        #[serde(rename = "scoringConfigId")]
        scoring_config_id: Id,
        weights: Value,
    },
}

struct Connection {
    id: u64,
    session_id: Option<Id>,
    tx: mpsc::UnboundedSender<Message>,
}

/// Tracks every live WebSocket connection so decisions and analytics events
/// can be pushed out without the caller knowing how many clients exist or
/// where they are.
pub struct ChannelRegistry {
    widget: parking_lot::RwLock<Vec<Connection>>,
    dashboard: parking_lot::RwLock<Vec<Connection>>,
    next_id: AtomicU64,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            widget: parking_lot::RwLock::new(Vec::new()),
            dashboard: parking_lot::RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn register(&self, channel: Channel, session_id: Option<Id>) -> (u64, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let connection = Connection { id, session_id, tx };
        match channel {
            Channel::Widget => self.widget.write().push(connection),
            Channel::Dashboard => self.dashboard.write().push(connection),
        }
        (id, rx)
    }

    pub(crate) fn unregister(&self, channel: Channel, id: u64) {
        match channel {
            Channel::Widget => self.widget.write().retain(|c| c.id != id),
            Channel::Dashboard => self.dashboard.write().retain(|c| c.id != id),
        }
    }

    /// Best-effort, non-blocking: a full or closed receiver is dropped
    /// silently rather than stalling the sender.
    pub fn broadcast_to_channel(&self, channel: Channel, payload: &Value) {
        let text = payload.to_string();
        let connections = match channel {
            Channel::Widget => self.widget.read(),
            Channel::Dashboard => self.dashboard.read(),
        };
        for connection in connections.iter() {
            let _ = connection.tx.send(Message::Text(text.clone()));
        }
    }

    /// Sends to exactly one connection, identified by the id `register`
    /// returned for it. Used to reply to the originating client only,
    /// rather than fan out to the whole channel.
    pub fn send_to(&self, channel: Channel, id: u64, payload: &Value) {
        let text = payload.to_string();
        let connections = match channel {
            Channel::Widget => self.widget.read(),
            Channel::Dashboard => self.dashboard.read(),
        };
        if let Some(connection) = connections.iter().find(|c| c.id == id) {
            let _ = connection.tx.send(Message::Text(text));
        }
    }

    pub fn broadcast_to_session(&self, session_id: &Id, payload: &Value) {
        let text = payload.to_string();
        for connection in self.widget.read().iter() {
            if connection.session_id.as_deref() == Some(session_id.as_str()) {
                let _ = connection.tx.send(Message::Text(text.clone()));
            }
        }
    }

    pub fn client_counts(&self) -> (usize, usize) {
        (self.widget.read().len(), self.dashboard.read().len())
    }
}

#[async_trait]
impl InterventionBroadcaster for ChannelRegistry {
    async fn broadcast_intervention(&self, session_id: &Id, intervention: &Intervention) {
        let payload = serde_json::json!({
            "type": "intervention",
            "intervention": intervention,
        });
        self.broadcast_to_session(session_id, &payload);
        let dashboard_payload = serde_json::json!({
            "type": "intervention_fired",
            "sessionId": session_id,
            "intervention": intervention,
        });
        self.broadcast_to_channel(Channel::Dashboard, &dashboard_payload);
    }
}

/// Runs one widget connection until it closes: reads `track`/`ping`/
/// `intervention_outcome` frames and dispatches them through `on_frame`,
/// which receives this connection's registry id so it can reply (e.g. a
/// `track_ack`) to this client alone; malformed JSON is dropped silently, a
/// frame with an unrecognized shape gets a `validation_error` frame back.
pub async fn handle_widget_socket<F, Fut>(socket: WebSocket, registry: Arc<ChannelRegistry>, session_id: Option<Id>, on_frame: F)
where
    F: Fn(WidgetFrame, u64) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let (mut sender, mut receiver) = socket.split();
    let (id, mut rx) = registry.register(Channel::Widget, session_id);

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = receiver.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let parsed: Result<Value, _> = serde_json::from_str(&text);
        let Ok(value) = parsed else {
            debug!("dropped malformed widget frame");
            continue;
        };
        match serde_json::from_value::<WidgetFrame>(value) {
            Ok(frame) => on_frame(frame, id).await,
            Err(err) => {
                warn!(?err, "widget frame failed schema validation");
                registry.send_to(
                    Channel::Widget,
                    id,
                    &serde_json::json!({ "type": "validation_error", "message": err.to_string() }),
                );
            }
        }
    }

    registry.unregister(Channel::Widget, id);
    writer.abort();
}

/// Same shape as [`handle_widget_socket`] for the dashboard channel.
pub async fn handle_dashboard_socket<F, Fut>(socket: WebSocket, registry: Arc<ChannelRegistry>, on_frame: F)
where
    F: Fn(DashboardFrame) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let (mut sender, mut receiver) = socket.split();
    let (id, mut rx) = registry.register(Channel::Dashboard, None);

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = receiver.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(value) = serde_json::from_str::<Value>(&text) else {
            debug!("dropped malformed dashboard frame");
            continue;
        };
        match serde_json::from_value::<DashboardFrame>(value) {
            Ok(frame) => on_frame(frame).await,
            Err(err) => {
                warn!(?err, "dashboard frame failed schema validation");
                registry.send_to(
                    Channel::Dashboard,
                    id,
                    &serde_json::json!({ "type": "validation_error", "message": err.to_string() }),
                );
            }
        }
    }

    registry.unregister(Channel::Dashboard, id);
    writer.abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_counts_reflect_registrations() {
        let registry = ChannelRegistry::new();
        let (id, _rx) = registry.register(Channel::Widget, Some("s1".to_string()));
        assert_eq!(registry.client_counts(), (1, 0));
        registry.unregister(Channel::Widget, id);
        assert_eq!(registry.client_counts(), (0, 0));
    }

    #[test]
    fn broadcast_to_session_only_reaches_matching_connection() {
        let registry = ChannelRegistry::new();
        let (_id1, mut rx1) = registry.register(Channel::Widget, Some("s1".to_string()));
        let (_id2, mut rx2) = registry.register(Channel::Widget, Some("s2".to_string()));

        registry.broadcast_to_session(&"s1".to_string(), &serde_json::json!({ "type": "ping" }));

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn send_to_only_reaches_the_named_connection() {
        let registry = ChannelRegistry::new();
        let (id1, mut rx1) = registry.register(Channel::Widget, Some("s1".to_string()));
        let (_id2, mut rx2) = registry.register(Channel::Widget, Some("s2".to_string()));

        registry.send_to(Channel::Widget, id1, &serde_json::json!({ "type": "validation_error" }));

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn widget_frame_parses_intervention_outcome() {
        let raw = serde_json::json!({
            "type": "intervention_outcome",
            "interventionId": "i1",
            "status": "dismissed",
        });
        let frame: WidgetFrame = serde_json::from_value(raw).unwrap();
        matches!(frame, WidgetFrame::InterventionOutcome { .. });
    }
}
