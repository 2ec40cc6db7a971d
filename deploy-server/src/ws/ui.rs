use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use dashmap::DashMap;
use deploy_sync::deploy::{DeployEvent, DeployEvents};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::state::AppState;

const BROADCAST_CAPACITY: usize = 256;
const MAX_QUEUE_PER_SITE: usize = 100;

#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub event_type: String,
    pub payload: Value,
    pub timestamp: i64,
}

#[derive(Clone)]
pub struct UiBroadcaster {
    tx: broadcast::Sender<String>,
    queue: Arc<DashMap<String, VecDeque<QueuedMessage>>>,
}

impl Default for UiBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl UiBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            tx,
            queue: Arc::new(DashMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn broadcast(&self, event_type: &str, payload: Value) {
        let msg = serde_json::json!({
            "type": event_type,
            "payload": payload,
        });

        // Queue deploy messages for replay
        if event_type.starts_with("deploy:") {
            if let Some(site) = payload.get("site").and_then(|v| v.as_str()) {
                let mut entry = self.queue.entry(site.to_string()).or_default();
                entry.push_back(QueuedMessage {
                    event_type: event_type.to_string(),
                    payload: payload.clone(),
                    timestamp: chrono::Utc::now().timestamp_millis(),
                });
                if entry.len() > MAX_QUEUE_PER_SITE {
                    entry.pop_front();
                }
            }
        }

        let _ = self.tx.send(msg.to_string());
    }

    pub fn get_queued_messages(&self, site: &str, since: i64) -> Vec<QueuedMessage> {
        self.queue
            .get(site)
            .map(|q| q.iter().filter(|m| m.timestamp > since).cloned().collect())
            .unwrap_or_default()
    }

    /// Queued events for `site` after `since`, encoded as outgoing frames.
    pub fn replay_frames(&self, site: &str, since: i64) -> Vec<String> {
        self.get_queued_messages(site, since)
            .into_iter()
            .map(|m| serde_json::json!({ "type": m.event_type, "payload": m.payload }).to_string())
            .collect()
    }
}

impl DeployEvents for UiBroadcaster {
    fn emit(&self, event: DeployEvent) {
        let payload = match serde_json::to_value(&event) {
            Ok(mut value) => value
                .get_mut("payload")
                .map(Value::take)
                .unwrap_or(Value::Null),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize deploy event");
                return;
            }
        };
        self.broadcast(event.event_type(), payload);
    }
}

/// Messages a browser may send on `/ws`.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum ClientMessage {
    /// Ask for the queued deploy events of one site newer than `since` (ms).
    #[serde(rename = "replay:request")]
    ReplayRequest {
        site: String,
        #[serde(default)]
        since: i64,
    },
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ui_socket(socket, state))
}

/// One loop per socket: live events come from the shared channel, replays
/// are written to this socket only.
async fn handle_ui_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.ui.subscribe();

    loop {
        let outgoing = tokio::select! {
            live = rx.recv() => match live {
                Ok(frame) => vec![frame],
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "UI client lagging, events dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::ReplayRequest { site, since }) => state.ui.replay_frames(&site, since),
                    Err(e) => {
                        tracing::debug!(error = %e, "Ignoring UI message");
                        continue;
                    }
                },
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => continue,
            },
        };

        for frame in outgoing {
            if sender.send(Message::Text(frame.into())).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deploy_sync::deploy::DeployStage;

    #[tokio::test]
    async fn test_deploy_events_are_broadcast_and_queued() {
        let ui = UiBroadcaster::new();
        let mut rx = ui.subscribe();

        ui.emit(DeployEvent::Stage {
            site: "shop".into(),
            upload_id: "u1".into(),
            stage: DeployStage::Merging,
        });

        let msg: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(msg["type"], "deploy:stage");
        assert_eq!(msg["payload"]["site"], "shop");
        assert_eq!(msg["payload"]["stage"], "merging");

        let queued = ui.get_queued_messages("shop", 0);
        assert_eq!(queued.len(), 1);
        assert!(ui.get_queued_messages("other", 0).is_empty());
    }

    #[tokio::test]
    async fn test_replay_stays_off_the_shared_channel() {
        let ui = UiBroadcaster::new();
        ui.emit(DeployEvent::Failed {
            site: "shop".into(),
            upload_id: "u1".into(),
            error: "disk full".into(),
        });
        let mut other_client = ui.subscribe();

        let frames = ui.replay_frames("shop", 0);

        assert_eq!(frames.len(), 1);
        let frame: Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(frame["type"], "deploy:failed");
        assert_eq!(frame["payload"]["error"], "disk full");
        assert!(matches!(
            other_client.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
        assert!(ui.replay_frames("shop", i64::MAX).is_empty());
    }

    #[test]
    fn test_client_message_parsing() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"replay:request","payload":{"site":"shop","since":42}}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::ReplayRequest {
                site: "shop".into(),
                since: 42
            }
        );
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"ping","payload":{}}"#).is_err());
    }
}
