//! Control-plane server: live reconfiguration over WebSocket
//!
//! Peers connect over a persistent WebSocket and exchange JSON envelopes
//! `{request_id, action: {type, payload}, meta, error}`. A hub task owns
//! the peer set and its register/unregister/broadcast mailboxes; each
//! connection runs an outbound pump (write deadline, periodic pings) and an
//! inbound pump (read deadline, frame size cap, text frames only).

use crate::balancer::Backend;
use crate::config::{Config, ServerSpec};
use crate::events::{payload, EventBus, EventKind};
use crate::router::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse as WsErrorResponse, Request as WsRequest, Response as WsResponse,
};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_hdr_async_with_config, WebSocketStream};
use tracing::{debug, error, info, warn};

/// Write deadline for any outbound frame
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Read deadline, refreshed by every received frame
pub const READ_TIMEOUT: Duration = Duration::from_secs(60);
/// Ping cadence, 90% of the read deadline
pub const PING_INTERVAL: Duration = Duration::from_secs(54);
/// Inbound frames above this size are rejected
pub const MAX_FRAME_BYTES: usize = 8192;

const OUTBOUND_QUEUE: usize = 256;
const HUB_MAILBOX: usize = 64;

/// Control-plane action discriminator; numeric on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ActionType {
    CreateServer,
    RollbackServer,
    AddServer,
    KillServer,
    RebootServer,
    Error,
}

impl From<ActionType> for u8 {
    fn from(kind: ActionType) -> u8 {
        match kind {
            ActionType::CreateServer => 0,
            ActionType::RollbackServer => 1,
            ActionType::AddServer => 2,
            ActionType::KillServer => 3,
            ActionType::RebootServer => 4,
            ActionType::Error => 5,
        }
    }
}

impl TryFrom<u8> for ActionType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, String> {
        match value {
            0 => Ok(ActionType::CreateServer),
            1 => Ok(ActionType::RollbackServer),
            2 => Ok(ActionType::AddServer),
            3 => Ok(ActionType::KillServer),
            4 => Ok(ActionType::RebootServer),
            5 => Ok(ActionType::Error),
            other => Err(format!("unknown action type {}", other)),
        }
    }
}

/// An action with its opaque payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: ActionType,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

/// The control-plane message envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub request_id: String,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub meta: Value,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Payload of an ERROR message
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    #[serde(default)]
    pub details: String,
}

/// Reply payload for CREATE/ROLLBACK commands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandReply {
    pub config: Config,
    pub success: bool,
}

impl Message {
    pub fn new<P: Serialize>(
        kind: ActionType,
        payload: &P,
        meta: Option<Value>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            request_id: String::new(),
            action: Action {
                kind,
                payload: serde_json::to_value(payload)?,
            },
            meta: meta.unwrap_or(Value::Null),
            error: String::new(),
        })
    }

    /// Build an ERROR message; the caller fills `request_id` when the
    /// inbound carried one.
    pub fn error(error: &str, details: &str) -> Self {
        Self {
            request_id: String::new(),
            action: Action {
                kind: ActionType::Error,
                payload: serde_json::to_value(ErrorPayload {
                    code: None,
                    details: details.to_string(),
                })
                .unwrap_or(Value::Null),
            },
            meta: Value::Null,
            error: error.to_string(),
        }
    }

    pub fn decode_payload<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        if self.action.payload.is_null() {
            anyhow::bail!("message payload is empty for type {:?}", self.action.kind);
        }
        serde_json::from_value(self.action.payload.clone()).map_err(|e| {
            anyhow::anyhow!(
                "failed to decode payload for type {:?}: {}",
                self.action.kind,
                e
            )
        })
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_empty() || self.action.kind == ActionType::Error
    }
}

/// Pluggable origin check, evaluated on upgrade
pub type OriginCheck = Arc<dyn Fn(Option<&str>, Option<&str>) -> bool + Send + Sync>;

/// The default check denies cross-origin upgrades: requests without an
/// Origin header pass, anything else must match the request host.
pub fn default_origin_check(origin: Option<&str>, host: Option<&str>) -> bool {
    let Some(origin) = origin else { return true };
    let Some(host) = host else { return false };
    let origin_host = origin
        .strip_prefix("https://")
        .or_else(|| origin.strip_prefix("http://"))
        .or_else(|| origin.strip_prefix("wss://"))
        .or_else(|| origin.strip_prefix("ws://"))
        .unwrap_or(origin);
    origin_host.eq_ignore_ascii_case(host)
}

enum HubCommand {
    Register {
        id: u64,
        outbound: mpsc::Sender<Message>,
    },
    Unregister(u64),
    Broadcast(Message),
}

/// Hub actor: exclusively owns the peer set.
async fn hub_loop(mut rx: mpsc::Receiver<HubCommand>, events: EventBus) {
    let mut peers: std::collections::HashMap<u64, mpsc::Sender<Message>> =
        std::collections::HashMap::new();

    while let Some(command) = rx.recv().await {
        match command {
            HubCommand::Register { id, outbound } => {
                peers.insert(id, outbound);
                info!(peer = id, total = peers.len(), "control peer registered");
            }
            HubCommand::Unregister(id) => {
                if peers.remove(&id).is_some() {
                    info!(peer = id, total = peers.len(), "control peer unregistered");
                }
            }
            HubCommand::Broadcast(message) => {
                peers.retain(|id, outbound| match outbound.try_send(message.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(peer = id, "broadcast queue full, dropping peer");
                        events.publish(
                            EventKind::ErrorDropped,
                            "control-plane broadcast dropped",
                            payload([("peer", *id as i64)]),
                        );
                        false
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                });
            }
        }
    }
}

struct ControlState {
    router: Arc<Router>,
    live: Arc<Mutex<Config>>,
    hub_tx: mpsc::Sender<HubCommand>,
    origin_check: OriginCheck,
    events: EventBus,
    next_id: AtomicU64,
}

/// Broadcasts to every connected control peer
#[derive(Clone)]
pub struct ControlBroadcaster {
    hub_tx: mpsc::Sender<HubCommand>,
}

impl ControlBroadcaster {
    pub async fn broadcast(&self, message: Message) {
        let _ = self.hub_tx.send(HubCommand::Broadcast(message)).await;
    }
}

/// The control-plane listener
pub struct ControlServer {
    state: Arc<ControlState>,
    bind_addr: SocketAddr,
    shutdown_rx: watch::Receiver<bool>,
    listener: Option<TcpListener>,
}

impl ControlServer {
    pub fn new(
        bind_addr: SocketAddr,
        router: Arc<Router>,
        live: Arc<Mutex<Config>>,
        events: EventBus,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let (hub_tx, hub_rx) = mpsc::channel(HUB_MAILBOX);
        tokio::spawn(hub_loop(hub_rx, events.clone()));

        Self {
            state: Arc::new(ControlState {
                router,
                live,
                hub_tx,
                origin_check: Arc::new(|origin, host| default_origin_check(origin, host)),
                events,
                next_id: AtomicU64::new(1),
            }),
            bind_addr,
            shutdown_rx,
            listener: None,
        }
    }

    /// Replace the origin check evaluated on upgrade.
    pub fn with_origin_check(mut self, check: OriginCheck) -> Self {
        let state = Arc::get_mut(&mut self.state)
            .expect("origin check must be set before the server is shared");
        state.origin_check = check;
        self
    }

    /// Bind now and report the effective local address. Useful with port 0.
    pub async fn bind(&mut self) -> anyhow::Result<SocketAddr> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        let addr = listener.local_addr()?;
        self.listener = Some(listener);
        Ok(addr)
    }

    /// Queue a message for every connected peer.
    pub async fn broadcast(&self, message: Message) {
        let _ = self.state.hub_tx.send(HubCommand::Broadcast(message)).await;
    }

    /// A cloneable handle for broadcasting after the server task starts.
    pub fn broadcaster(&self) -> ControlBroadcaster {
        ControlBroadcaster {
            hub_tx: self.state.hub_tx.clone(),
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let listener = match self.listener.take() {
            Some(listener) => listener,
            None => TcpListener::bind(self.bind_addr).await?,
        };
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "control plane listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(handle_socket(state, stream, peer_addr));
                        }
                        Err(e) => error!(error = %e, "control accept failed"),
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("control plane shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_socket(state: Arc<ControlState>, stream: TcpStream, peer_addr: SocketAddr) {
    let check = Arc::clone(&state.origin_check);
    let callback = move |req: &WsRequest, response: WsResponse| {
        let origin = req.headers().get("origin").and_then(|v| v.to_str().ok());
        let host = req.headers().get("host").and_then(|v| v.to_str().ok());
        if check(origin, host) {
            Ok(response)
        } else {
            warn!(origin = ?origin, "cross-origin control upgrade denied");
            let mut denied = WsErrorResponse::new(Some("origin not allowed".to_string()));
            *denied.status_mut() = tokio_tungstenite::tungstenite::http::StatusCode::FORBIDDEN;
            Err(denied)
        }
    };

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(MAX_FRAME_BYTES);
    ws_config.max_frame_size = Some(MAX_FRAME_BYTES);

    let ws = match accept_hdr_async_with_config(stream, callback, Some(ws_config)).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(peer = %peer_addr, error = %e, "control upgrade failed");
            return;
        }
    };
    info!(peer = %peer_addr, "control peer connected");

    let (sink, stream) = ws.split();
    let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let id = state.next_id.fetch_add(1, Ordering::Relaxed);
    let _ = state
        .hub_tx
        .send(HubCommand::Register {
            id,
            outbound: out_tx.clone(),
        })
        .await;

    let writer = tokio::spawn(write_pump(sink, out_rx));

    let read_state = Arc::clone(&state);
    let read_out = out_tx.clone();
    read_pump(stream, move |text| {
        match serde_json::from_str::<Message>(text) {
            Ok(message) => handle_message(&read_state, message, &read_out),
            Err(e) => {
                debug!(error = %e, "undecodable control message");
                send_to_peer(
                    &read_out,
                    Message::error("Invalid message format", &e.to_string()),
                    &read_state.events,
                );
            }
        }
    })
    .await;

    let _ = state.hub_tx.send(HubCommand::Unregister(id)).await;
    drop(out_tx);
    let _ = writer.await;
    info!(peer = %peer_addr, "control peer disconnected");
}

/// Outbound pump: drains the queue under a write deadline and pings the
/// peer before the read deadline would expire.
pub(crate) async fn write_pump<S>(
    mut sink: SplitSink<WebSocketStream<S>, WsMessage>,
    mut rx: mpsc::Receiver<Message>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut ping = tokio::time::interval_at(
        tokio::time::Instant::now() + PING_INTERVAL,
        PING_INTERVAL,
    );

    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(message) => {
                    let text = match serde_json::to_string(&message) {
                        Ok(text) => text,
                        Err(e) => {
                            error!(error = %e, "failed to encode control message");
                            continue;
                        }
                    };
                    match tokio::time::timeout(WRITE_TIMEOUT, sink.send(WsMessage::Text(text))).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            debug!(error = %e, "control write failed");
                            break;
                        }
                        Err(_) => {
                            warn!("control write deadline exceeded");
                            break;
                        }
                    }
                }
                None => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break;
                }
            },
            _ = ping.tick() => {
                if tokio::time::timeout(WRITE_TIMEOUT, sink.send(WsMessage::Ping(Vec::new())))
                    .await
                    .map(|r| r.is_err())
                    .unwrap_or(true)
                {
                    debug!("control ping failed");
                    break;
                }
            }
        }
    }
}

/// Inbound pump: reads under a deadline refreshed by every frame, rejects
/// non-text frames, and hands text frames to the handler.
pub(crate) async fn read_pump<S, F>(mut stream: SplitStream<WebSocketStream<S>>, mut on_text: F)
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnMut(&str),
{
    loop {
        match tokio::time::timeout(READ_TIMEOUT, stream.next()).await {
            Err(_) => {
                warn!("control read deadline exceeded");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(error = %e, "control read error");
                break;
            }
            Ok(Some(Ok(frame))) => match frame {
                WsMessage::Text(text) => on_text(&text),
                WsMessage::Binary(_) => debug!("ignoring non-text control frame"),
                WsMessage::Ping(_) | WsMessage::Pong(_) => {}
                WsMessage::Close(_) => break,
                WsMessage::Frame(_) => {}
            },
        }
    }
}

/// Queue a message to one peer; the queue drops on full with a warning.
pub(crate) fn send_to_peer(out: &mpsc::Sender<Message>, message: Message, events: &EventBus) {
    match out.try_send(message) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(dropped)) => {
            warn!(kind = ?dropped.action.kind, "control outbound queue full, dropping message");
            events.publish(
                EventKind::ErrorDropped,
                "control-plane outbound message dropped",
                payload([("action", format!("{:?}", dropped.action.kind))]),
            );
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("control outbound channel closed");
        }
    }
}

/// Apply one inbound control message.
fn handle_message(state: &Arc<ControlState>, message: Message, out: &mpsc::Sender<Message>) {
    match message.action.kind {
        ActionType::CreateServer => {
            let config: Config = match message.decode_payload() {
                Ok(config) => config,
                Err(e) => {
                    let mut reply = Message::error("Invalid config struct provided", &e.to_string());
                    reply.request_id = message.request_id.clone();
                    send_to_peer(out, reply, &state.events);
                    return;
                }
            };

            let snapshot = {
                let mut live = state.live.lock();
                for spec in &config.servers {
                    live.servers.push(spec.clone());
                    state.router.insert(spec);
                }
                if config.healthcheck_interval != 0 {
                    live.healthcheck_interval = config.healthcheck_interval;
                }
                if !config.log_output.is_empty() {
                    live.log_output = config.log_output.clone();
                }
                live.clone()
            };
            info!(servers = config.servers.len(), "control plane added servers");

            if !message.request_id.is_empty() {
                reply_with_config(state, out, ActionType::CreateServer, &message.request_id, snapshot);
            }
        }
        ActionType::RollbackServer => {
            let spec: ServerSpec = match message.decode_payload() {
                Ok(spec) => spec,
                Err(e) => {
                    let mut reply =
                        Message::error("No server provided for roll backing", &e.to_string());
                    reply.request_id = message.request_id.clone();
                    send_to_peer(out, reply, &state.events);
                    return;
                }
            };

            let snapshot = {
                let mut live = state.live.lock();
                let mut matched = false;
                for slot in live.servers.iter_mut() {
                    if slot.name == spec.name {
                        *slot = spec.clone();
                        matched = true;
                    }
                }
                if matched {
                    // Swap the balancing set on the live backend first so
                    // in-flight traffic rotates over the new members, then
                    // recompile the handler.
                    if !spec.balance.is_empty() {
                        if let Some(existing) = state.router.current().backend(&spec.name) {
                            let members = spec
                                .balance
                                .iter()
                                .map(|m| Arc::new(Backend::from_spec(m)))
                                .collect();
                            existing.rollback(members);
                        }
                    }
                    state.router.insert(&spec);
                    info!(server = %spec.name, "control plane rolled back server");
                }
                live.clone()
            };

            if !message.request_id.is_empty() {
                reply_with_config(state, out, ActionType::RollbackServer, &message.request_id, snapshot);
            }
        }
        other => {
            debug!(kind = ?other, "unsupported control action");
            let mut reply = Message::error(
                "Unsupported action type",
                &format!("action type {:?} is not handled", other),
            );
            reply.request_id = message.request_id.clone();
            send_to_peer(out, reply, &state.events);
        }
    }
}

fn reply_with_config(
    state: &Arc<ControlState>,
    out: &mpsc::Sender<Message>,
    kind: ActionType,
    request_id: &str,
    config: Config,
) {
    match Message::new(
        kind,
        &CommandReply {
            config,
            success: true,
        },
        None,
    ) {
        Ok(mut reply) => {
            reply.request_id = request_id.to_string();
            send_to_peer(out, reply, &state.events);
        }
        Err(e) => {
            error!(error = %e, "failed to build control reply");
            let mut reply = Message::error("Failed to encode reply", &e.to_string());
            reply.request_id = request_id.to_string();
            send_to_peer(out, reply, &state.events);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_type_wire_numbers() {
        assert_eq!(u8::from(ActionType::CreateServer), 0);
        assert_eq!(u8::from(ActionType::RollbackServer), 1);
        assert_eq!(u8::from(ActionType::AddServer), 2);
        assert_eq!(u8::from(ActionType::KillServer), 3);
        assert_eq!(u8::from(ActionType::RebootServer), 4);
        assert_eq!(u8::from(ActionType::Error), 5);

        assert_eq!(ActionType::try_from(1).unwrap(), ActionType::RollbackServer);
        assert!(ActionType::try_from(9).is_err());
    }

    #[test]
    fn test_envelope_roundtrip() {
        let message = Message::new(
            ActionType::CreateServer,
            &serde_json::json!({"server": []}),
            Some(serde_json::json!({"source": "test"})),
        )
        .unwrap();

        let text = serde_json::to_string(&message).unwrap();
        assert!(text.contains("\"type\":0"));
        assert!(text.contains("\"request_id\":\"\""));

        let parsed: Message = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.action.kind, ActionType::CreateServer);
        assert_eq!(parsed.meta["source"], "test");
        assert!(!parsed.is_error());
    }

    #[test]
    fn test_envelope_defaults_on_sparse_input() {
        let parsed: Message =
            serde_json::from_str(r#"{"action":{"type":5,"payload":{"details":"x"}}}"#).unwrap();
        assert!(parsed.request_id.is_empty());
        assert!(parsed.is_error());
        let payload: ErrorPayload = parsed.decode_payload().unwrap();
        assert_eq!(payload.details, "x");
    }

    #[test]
    fn test_decode_payload_rejects_empty() {
        let message = Message {
            request_id: String::new(),
            action: Action {
                kind: ActionType::CreateServer,
                payload: Value::Null,
            },
            meta: Value::Null,
            error: String::new(),
        };
        assert!(message.decode_payload::<Config>().is_err());
    }

    #[test]
    fn test_error_message_shape() {
        let message = Message::error("bad input", "missing field");
        assert_eq!(message.action.kind, ActionType::Error);
        assert!(message.is_error());
        let payload: ErrorPayload = message.decode_payload().unwrap();
        assert_eq!(payload.details, "missing field");
    }

    #[test]
    fn test_command_reply_serializes_success() {
        let reply = Message::new(
            ActionType::CreateServer,
            &CommandReply {
                config: Config::default(),
                success: true,
            },
            None,
        )
        .unwrap();
        let text = serde_json::to_string(&reply).unwrap();
        assert!(text.contains("\"success\":true"));
    }

    #[test]
    fn test_default_origin_check() {
        // No Origin header: not a browser, allow.
        assert!(default_origin_check(None, Some("127.0.0.1:7654")));
        // Same origin allowed.
        assert!(default_origin_check(
            Some("http://127.0.0.1:7654"),
            Some("127.0.0.1:7654")
        ));
        assert!(default_origin_check(
            Some("https://Control.Example.com"),
            Some("control.example.com")
        ));
        // Cross-origin denied.
        assert!(!default_origin_check(
            Some("http://evil.example.com"),
            Some("127.0.0.1:7654")
        ));
        assert!(!default_origin_check(Some("http://a"), None));
    }
}
