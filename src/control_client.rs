//! Control-plane client
//!
//! Connects to a control-plane server, correlates request/response pairs by
//! request id, and surfaces unsolicited server messages on a bounded
//! incoming queue that drops with a warning when nobody is draining it.
//! Dropping a pending `send_request` future reaps its correlation entry;
//! a disconnect closes every pending waiter.

use crate::control::{
    read_pump, write_pump, ActionType, ErrorPayload, Message, MAX_FRAME_BYTES,
};
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async_with_config;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, info, warn};
use uuid::Uuid;

const INCOMING_QUEUE: usize = 100;
const OUTBOUND_QUEUE: usize = 256;

struct ClientShared {
    pending: Mutex<HashMap<String, oneshot::Sender<Message>>>,
    connected: AtomicBool,
}

impl ClientShared {
    /// Route a received message: correlated response or unsolicited push.
    fn route(&self, message: Message, incoming: &mpsc::Sender<Message>) {
        if !message.request_id.is_empty() {
            if let Some(waiter) = self.pending.lock().remove(&message.request_id) {
                debug!(request_id = %message.request_id, "correlated control response");
                let _ = waiter.send(message);
                return;
            }
        }
        if incoming.try_send(message).is_err() {
            warn!("incoming control queue full, dropping message");
        }
    }

    /// Purge pending waiters; receivers observe the closed channel.
    fn disconnect(&self) {
        self.connected.store(false, Ordering::Relaxed);
        let mut pending = self.pending.lock();
        if !pending.is_empty() {
            info!(pending = pending.len(), "cleaning up pending control requests");
        }
        pending.clear();
    }
}

/// Client side of the control plane
pub struct ControlClient {
    shared: Arc<ClientShared>,
    outbound: mpsc::Sender<Message>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<Message>>,
}

impl ControlClient {
    /// Connect to `url` (a `ws://` address), optionally sending extra
    /// headers with the upgrade request.
    pub async fn connect(url: &str, headers: &[(String, String)]) -> anyhow::Result<Self> {
        use tokio_tungstenite::tungstenite::http::header::{HeaderName, HeaderValue};

        let mut request = url.into_client_request()?;
        for (name, value) in headers {
            request.headers_mut().insert(
                HeaderName::try_from(name.as_str())?,
                HeaderValue::try_from(value.as_str())?,
            );
        }

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(MAX_FRAME_BYTES);
        ws_config.max_frame_size = Some(MAX_FRAME_BYTES);

        let (ws, _response) = connect_async_with_config(request, Some(ws_config), false).await?;
        info!(url = %url, "connected to control plane");

        let shared = Arc::new(ClientShared {
            pending: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(true),
        });

        let (sink, stream) = ws.split();
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_QUEUE);

        tokio::spawn(write_pump(sink, out_rx));

        let read_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            read_pump(stream, |text| match serde_json::from_str::<Message>(text) {
                Ok(message) => read_shared.route(message, &incoming_tx),
                Err(e) => warn!(error = %e, "undecodable control message from server"),
            })
            .await;
            read_shared.disconnect();
        });

        Ok(Self {
            shared,
            outbound: out_tx,
            incoming: tokio::sync::Mutex::new(incoming_rx),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Relaxed)
    }

    /// Fire-and-forget send.
    pub fn send(&self, message: Message) -> anyhow::Result<()> {
        if !self.is_connected() {
            anyhow::bail!("client not connected");
        }
        self.outbound
            .try_send(message)
            .map_err(|_| anyhow::anyhow!("outbound queue unavailable"))
    }

    /// Send a request and wait for the correlated response.
    ///
    /// Cancelling the returned future (for example through a timeout) reaps
    /// the correlation entry. An ERROR response resolves to an error.
    pub async fn send_request<P: Serialize>(
        &self,
        kind: ActionType,
        payload: &P,
        meta: Option<Value>,
    ) -> anyhow::Result<Message> {
        if !self.is_connected() {
            anyhow::bail!("client not connected");
        }

        let request_id = Uuid::new_v4().to_string();
        let mut message = Message::new(kind, payload, meta)?;
        message.request_id = request_id.clone();

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(request_id.clone(), tx);
        let _guard = PendingGuard {
            shared: Arc::clone(&self.shared),
            request_id: request_id.clone(),
        };

        debug!(request_id = %request_id, kind = ?kind, "sending control request");
        self.outbound
            .send(message)
            .await
            .map_err(|_| anyhow::anyhow!("connection closed before request was sent"))?;

        let response = rx
            .await
            .map_err(|_| anyhow::anyhow!("connection closed while waiting for response"))?;

        if response.is_error() {
            let mut detail = response.error.clone();
            if detail.is_empty() {
                detail = "received error event".to_string();
            }
            if let Ok(payload) = response.decode_payload::<ErrorPayload>() {
                if !payload.details.is_empty() {
                    detail = format!("{}: {}", detail, payload.details);
                }
            }
            anyhow::bail!("server error response for request {}: {}", request_id, detail);
        }
        Ok(response)
    }

    /// Next unsolicited server message, if the connection still produces
    /// them.
    pub async fn next_incoming(&self) -> Option<Message> {
        self.incoming.lock().await.recv().await
    }

    /// Close the connection; pending requests observe the disconnect.
    pub fn close(&self) {
        self.shared.disconnect();
    }
}

/// Removes a pending correlation entry when the request future settles or
/// is cancelled.
struct PendingGuard {
    shared: Arc<ClientShared>,
    request_id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.shared.pending.lock().remove(&self.request_id);
    }
}
