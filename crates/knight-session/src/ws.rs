//! WebSocket transport to the protocol bridge.
//!
//! Knight does not speak the WhatsApp wire protocol itself. A separate
//! bridge process does (pairing, Noise handshake, Signal sessions) and is
//! reached at `connection.bridge_url`. This side exchanges JSON envelopes
//! with it: the `hello` names the service address the resolver picked, so
//! the bridge dials that instead of doing its own lookup. Requests carry an
//! id and are answered by a `reply` frame with the same id. Liveness uses
//! WebSocket ping/pong.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use futures_util::{SinkExt, StreamExt};
use knight_core::{
    error::KnightError,
    event::{
        ConnectionUpdate, CredentialRecord, DisconnectReason, GroupMetadata, InboundEvent,
        MediaRef, OutgoingMessage, ParticipantAction, Presence,
    },
    traits::{ConnectParams, Connection, ProtocolClient, Transport},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::{frame::coding::CloseCode, CloseFrame, Message},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Close codes at or above this carry `4000 + protocol status`.
const STATUS_CLOSE_BASE: u16 = 4000;

/// Frames sent to the bridge.
#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request<'a> {
    Hello {
        service: ServiceTarget<'a>,
        credentials: Option<&'a CredentialRecord>,
        keepalive_ms: u64,
    },
    Send {
        id: &'a str,
        message: &'a OutgoingMessage,
    },
    Presence {
        id: &'a str,
        chat_id: &'a str,
        presence: Presence,
    },
    GroupMetadata {
        id: &'a str,
        group_id: &'a str,
    },
    UpdateParticipants {
        id: &'a str,
        group_id: &'a str,
        participants: &'a [String],
        action: ParticipantAction,
    },
    DownloadMedia {
        id: &'a str,
        media: &'a MediaRef,
    },
}

/// Where the bridge should open the upstream connection.
#[derive(Debug, Serialize)]
struct ServiceTarget<'a> {
    host: &'a str,
    address: Ipv4Addr,
    port: u16,
}

/// Frames received from the bridge.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Frame {
    /// Handshake finished; carries the bot's own JID.
    Ready { jid: String },
    Event { event: InboundEvent },
    Reply {
        id: String,
        #[serde(default)]
        result: serde_json::Value,
        #[serde(default)]
        error: Option<String>,
    },
}

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<Result<serde_json::Value, String>>>>>;
type Pongs = Arc<Mutex<HashMap<Vec<u8>, oneshot::Sender<()>>>>;

/// Protocol client that reaches the bridge at a fixed `ws://` or `wss://` URL.
pub struct WsClient {
    bridge_url: String,
}

impl WsClient {
    pub fn new(bridge_url: impl Into<String>) -> Self {
        Self {
            bridge_url: bridge_url.into(),
        }
    }
}

#[async_trait]
impl ProtocolClient for WsClient {
    fn name(&self) -> &str {
        "websocket"
    }

    async fn connect(&self, params: ConnectParams) -> Result<Connection, KnightError> {
        let (ws, _response) = connect_async(self.bridge_url.as_str())
            .await
            .map_err(|e| {
                KnightError::Transport(format!("bridge {} unreachable: {e}", self.bridge_url))
            })?;
        info!(
            "ws: bridge {} connected, upstream {}:{} via {}",
            self.bridge_url, params.host, params.port, params.address
        );

        let (mut sink, mut stream) = ws.split();
        let hello = serde_json::to_string(&Request::Hello {
            service: ServiceTarget {
                host: &params.host,
                address: params.address,
                port: params.port,
            },
            credentials: params.credentials.as_ref(),
            keepalive_ms: params.keepalive_interval.as_millis() as u64,
        })?;
        sink.send(Message::Text(hello))
            .await
            .map_err(|e| KnightError::Transport(format!("hello: {e}")))?;

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(64);
        let (event_tx, event_rx) = mpsc::channel::<InboundEvent>(256);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let pongs: Pongs = Arc::new(Mutex::new(HashMap::new()));
        let own_id = Arc::new(RwLock::new(None));

        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = sink.send(msg).await {
                    debug!("ws: write failed: {e}");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let reader = {
            let pending = pending.clone();
            let pongs = pongs.clone();
            let own_id = own_id.clone();
            tokio::spawn(async move {
                let reason = loop {
                    let Some(next) = stream.next().await else {
                        break DisconnectReason::ConnectionClosed;
                    };
                    let msg = match next {
                        Ok(msg) => msg,
                        Err(e) => break DisconnectReason::Transport(e.to_string()),
                    };
                    match msg {
                        Message::Text(text) => {
                            match handle_frame(&text, &pending, &own_id, &event_tx).await {
                                Ok(true) => {}
                                Ok(false) => return,
                                Err(e) => warn!("ws: bad frame: {e}"),
                            }
                        }
                        Message::Pong(payload) => {
                            let waiter = lock(&pongs).remove(&payload);
                            if let Some(waiter) = waiter {
                                let _ = waiter.send(());
                            }
                        }
                        Message::Close(frame) => {
                            break frame
                                .map(|f| reason_from_close(u16::from(f.code)))
                                .unwrap_or(DisconnectReason::ConnectionClosed);
                        }
                        _ => {}
                    }
                };
                debug!("ws: stream ended: {reason}");
                lock(&pending).clear();
                let _ = event_tx
                    .send(InboundEvent::ConnectionUpdate(ConnectionUpdate::Close(reason)))
                    .await;
            })
        };

        let transport = WsTransport {
            outbound: out_tx,
            pending,
            pongs,
            own_id,
            tasks: Mutex::new(Some((reader, writer))),
        };
        Ok(Connection {
            transport: Arc::new(transport),
            events: event_rx,
        })
    }
}

/// Apply one text frame. Returns `Ok(false)` once nobody listens for events.
async fn handle_frame(
    text: &str,
    pending: &Pending,
    own_id: &RwLock<Option<String>>,
    events: &mpsc::Sender<InboundEvent>,
) -> Result<bool, KnightError> {
    match serde_json::from_str::<Frame>(text)? {
        Frame::Ready { jid } => {
            debug!("ws: bridge ready as {jid}");
            *own_id.write().unwrap_or_else(|e| e.into_inner()) = Some(jid);
        }
        Frame::Event { event } => {
            if events.send(event).await.is_err() {
                return Ok(false);
            }
        }
        Frame::Reply { id, result, error } => {
            let waiter = lock(pending).remove(&id);
            match waiter {
                Some(waiter) => {
                    let _ = waiter.send(match error {
                        Some(e) => Err(e),
                        None => Ok(result),
                    });
                }
                None => debug!("ws: reply for unknown request {id}"),
            }
        }
    }
    Ok(true)
}

/// Map a WebSocket close code to a disconnect reason.
pub fn reason_from_close(code: u16) -> DisconnectReason {
    match code {
        c if c >= STATUS_CLOSE_BASE => DisconnectReason::from_status(c - STATUS_CLOSE_BASE),
        1000 | 1001 => DisconnectReason::ConnectionClosed,
        _ => DisconnectReason::ConnectionLost,
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

struct WsTransport {
    outbound: mpsc::Sender<Message>,
    pending: Pending,
    pongs: Pongs,
    own_id: Arc<RwLock<Option<String>>>,
    tasks: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl WsTransport {
    /// Send a request frame and wait for the matching reply.
    async fn call(&self, id: &str, request: &Request<'_>) -> Result<serde_json::Value, KnightError> {
        let text = serde_json::to_string(request)?;
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id.to_string(), tx);

        if self.outbound.send(Message::Text(text)).await.is_err() {
            lock(&self.pending).remove(id);
            return Err(KnightError::Transport("connection closed".into()));
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => Err(KnightError::Transport(e)),
            Ok(Err(_)) => Err(KnightError::Transport("connection closed".into())),
            Err(_) => {
                lock(&self.pending).remove(id);
                Err(KnightError::Transport(format!("request {id} timed out")))
            }
        }
    }
}

fn request_id() -> String {
    Uuid::new_v4().to_string()
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&self, message: OutgoingMessage) -> Result<(), KnightError> {
        let id = request_id();
        self.call(&id, &Request::Send { id: &id, message: &message })
            .await
            .map(|_| ())
    }

    async fn probe(&self) -> Result<(), KnightError> {
        let payload = Uuid::new_v4().as_bytes().to_vec();
        let (tx, rx) = oneshot::channel();
        lock(&self.pongs).insert(payload.clone(), tx);
        self.outbound
            .send(Message::Ping(payload))
            .await
            .map_err(|_| KnightError::Transport("connection closed".into()))?;
        rx.await
            .map_err(|_| KnightError::Transport("connection closed before pong".into()))
    }

    async fn close(&self) -> Result<(), KnightError> {
        let tasks = lock(&self.tasks).take();
        let Some((reader, writer)) = tasks else {
            return Ok(());
        };
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        };
        let _ = self.outbound.send(Message::Close(Some(frame))).await;
        let _ = tokio::time::timeout(CLOSE_GRACE, writer).await;
        reader.abort();
        lock(&self.pongs).clear();
        debug!("ws: transport closed");
        Ok(())
    }

    async fn presence(&self, chat_id: &str, presence: Presence) -> Result<(), KnightError> {
        let id = request_id();
        self.call(&id, &Request::Presence { id: &id, chat_id, presence })
            .await
            .map(|_| ())
    }

    async fn group_metadata(&self, group_id: &str) -> Result<GroupMetadata, KnightError> {
        let id = request_id();
        let value = self
            .call(&id, &Request::GroupMetadata { id: &id, group_id })
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn update_participants(
        &self,
        group_id: &str,
        participants: &[String],
        action: ParticipantAction,
    ) -> Result<(), KnightError> {
        let id = request_id();
        let request = Request::UpdateParticipants {
            id: &id,
            group_id,
            participants,
            action,
        };
        self.call(&id, &request).await.map(|_| ())
    }

    async fn download_media(&self, media: &MediaRef) -> Result<Vec<u8>, KnightError> {
        let id = request_id();
        let value = self
            .call(&id, &Request::DownloadMedia { id: &id, media })
            .await?;
        let data = value
            .get("data")
            .and_then(|d| d.as_str())
            .ok_or_else(|| KnightError::Transport("media reply without data".into()))?;
        BASE64
            .decode(data)
            .map_err(|e| KnightError::Transport(format!("media payload: {e}")))
    }

    fn own_id(&self) -> Option<String> {
        self.own_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_codes_map_to_reasons() {
        assert_eq!(reason_from_close(4401), DisconnectReason::LoggedOut);
        assert_eq!(reason_from_close(4515), DisconnectReason::RestartRequired);
        assert_eq!(reason_from_close(1000), DisconnectReason::ConnectionClosed);
        assert_eq!(reason_from_close(1006), DisconnectReason::ConnectionLost);
        assert!(reason_from_close(4440).is_terminal());
        assert!(!reason_from_close(1011).is_terminal());
    }

    #[test]
    fn test_request_envelopes() {
        let msg = OutgoingMessage::text("1@s.whatsapp.net", "hi");
        let json = serde_json::to_value(Request::Send {
            id: "r1",
            message: &msg,
        })
        .unwrap();
        assert_eq!(json["op"], "send");
        assert_eq!(json["id"], "r1");
        assert_eq!(json["message"]["content"]["text"], "hi");

        let json = serde_json::to_value(Request::Hello {
            service: ServiceTarget {
                host: "web.whatsapp.com",
                address: Ipv4Addr::new(157, 240, 22, 54),
                port: 443,
            },
            credentials: None,
            keepalive_ms: 30_000,
        })
        .unwrap();
        assert_eq!(json["op"], "hello");
        assert_eq!(json["service"]["address"], "157.240.22.54");
        assert_eq!(json["service"]["port"], 443);
        assert!(json["credentials"].is_null());
    }

    #[tokio::test]
    async fn test_frames_route_to_events_and_replies() {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let own_id = RwLock::new(None);
        let (event_tx, mut event_rx) = mpsc::channel(4);

        let ready = r#"{"op":"ready","jid":"100@s.whatsapp.net"}"#;
        assert!(handle_frame(ready, &pending, &own_id, &event_tx).await.unwrap());
        assert_eq!(own_id.read().unwrap().as_deref(), Some("100@s.whatsapp.net"));

        let event = r#"{"op":"event","event":{"type":"connection_update","data":{"connection":"open"}}}"#;
        assert!(handle_frame(event, &pending, &own_id, &event_tx).await.unwrap());
        assert_eq!(
            event_rx.recv().await.unwrap(),
            InboundEvent::ConnectionUpdate(ConnectionUpdate::Open)
        );

        let (tx, rx) = oneshot::channel();
        pending.lock().unwrap().insert("r1".into(), tx);
        let reply = r#"{"op":"reply","id":"r1","error":"not admin"}"#;
        assert!(handle_frame(reply, &pending, &own_id, &event_tx).await.unwrap());
        assert_eq!(rx.await.unwrap(), Err("not admin".to_string()));

        assert!(handle_frame("{}", &pending, &own_id, &event_tx).await.is_err());
    }

    type BridgeSide = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

    async fn next_json(ws: &mut BridgeSide) -> serde_json::Value {
        loop {
            if let Message::Text(text) = ws.next().await.unwrap().unwrap() {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    /// Accepts one connection and plays the bridge side of a short session.
    async fn fake_bridge(
        listener: tokio::net::TcpListener,
        seen: Arc<Mutex<Vec<serde_json::Value>>>,
    ) {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

        let hello = next_json(&mut ws).await;
        seen.lock().unwrap().push(hello);

        let ready = r#"{"op":"ready","jid":"100@s.whatsapp.net"}"#;
        let open = r#"{"op":"event","event":{"type":"connection_update","data":{"connection":"open"}}}"#;
        ws.send(Message::Text(ready.into())).await.unwrap();
        ws.send(Message::Text(open.into())).await.unwrap();

        let request = next_json(&mut ws).await;
        let reply = serde_json::json!({ "op": "reply", "id": request["id"], "result": {} });
        seen.lock().unwrap().push(request);
        ws.send(Message::Text(reply.to_string())).await.unwrap();

        ws.send(Message::Close(Some(CloseFrame {
            code: CloseCode::from(4401),
            reason: "logged out".into(),
        })))
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_session_through_bridge() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/knight", listener.local_addr().unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let bridge = tokio::spawn(fake_bridge(listener, seen.clone()));

        let client = WsClient::new(url);
        let mut conn = client
            .connect(ConnectParams {
                host: "web.whatsapp.com".into(),
                address: Ipv4Addr::new(157, 240, 22, 54),
                port: 443,
                credentials: None,
                connect_timeout: Duration::from_secs(5),
                keepalive_interval: Duration::from_secs(30),
            })
            .await
            .unwrap();

        assert_eq!(
            conn.events.recv().await.unwrap(),
            InboundEvent::ConnectionUpdate(ConnectionUpdate::Open)
        );
        assert_eq!(conn.transport.own_id().as_deref(), Some("100@s.whatsapp.net"));
        conn.transport
            .send(OutgoingMessage::text("1@s.whatsapp.net", "hi"))
            .await
            .unwrap();
        assert_eq!(
            conn.events.recv().await.unwrap(),
            InboundEvent::ConnectionUpdate(ConnectionUpdate::Close(DisconnectReason::LoggedOut))
        );
        bridge.await.unwrap();

        let seen = seen.lock().unwrap();
        // The bridge is told which upstream address to dial.
        assert_eq!(seen[0]["op"], "hello");
        assert_eq!(seen[0]["service"]["host"], "web.whatsapp.com");
        assert_eq!(seen[0]["service"]["address"], "157.240.22.54");
        assert_eq!(seen[0]["keepalive_ms"], 30_000);
        assert_eq!(seen[1]["op"], "send");
        assert_eq!(seen[1]["message"]["content"]["text"], "hi");
    }

    #[tokio::test]
    async fn test_unreachable_bridge_is_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/knight", listener.local_addr().unwrap());
        drop(listener);

        let err = WsClient::new(url)
            .connect(ConnectParams {
                host: "web.whatsapp.com".into(),
                address: Ipv4Addr::new(157, 240, 22, 54),
                port: 443,
                credentials: None,
                connect_timeout: Duration::from_secs(5),
                keepalive_interval: Duration::from_secs(30),
            })
            .await
            .err()
            .unwrap();
        assert!(matches!(err, KnightError::Transport(_)));
    }
}
