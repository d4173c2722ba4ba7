//! Realtime transport capability and its WebSocket implementation.
//!
//! A transport opens [`Session`]s. A session is a pair of channels: outbound
//! [`ClientMessage`]s and inbound [`TransportEvent`]s. The socket itself is
//! owned by a driver task, so the connection manager never blocks on IO
//! while it waits for commands.

use super::{ClientMessage, ServerMessage};
use crate::auth::AuthToken;
use crate::error::TransportError;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use listsync_engine::DisconnectReason;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;

/// Something that happened on an open session.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(ServerMessage),
    /// The session is gone; no further events follow
    Closed(DisconnectReason),
}

/// The client side of an open realtime session. Dropping it closes the session.
#[derive(Debug)]
pub struct Session {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    shutdown: CancellationToken,
}

/// The driver side of a session: whoever owns the socket holds this.
#[derive(Debug)]
pub struct SessionPeer {
    pub outbound: mpsc::UnboundedReceiver<ClientMessage>,
    pub events: mpsc::UnboundedSender<TransportEvent>,
    pub shutdown: CancellationToken,
}

impl Session {
    /// Create a connected session/peer pair.
    pub fn channel() -> (Session, SessionPeer) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        (
            Session {
                outbound: outbound_tx,
                events: events_rx,
                shutdown: shutdown.clone(),
            },
            SessionPeer {
                outbound: outbound_rx,
                events: events_tx,
                shutdown,
            },
        )
    }

    pub fn send(&self, message: ClientMessage) -> Result<(), TransportError> {
        self.outbound
            .send(message)
            .map_err(|_| TransportError::Closed)
    }

    /// Wait for the next event. A driver that vanished reads as a transport close.
    pub async fn next_event(&mut self) -> TransportEvent {
        self.events
            .recv()
            .await
            .unwrap_or(TransportEvent::Closed(DisconnectReason::TransportClose))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Pre-flight reachability check of the realtime endpoint.
    async fn probe(&self) -> Result<(), TransportError>;

    /// Open an authenticated session.
    async fn open(&self, token: &AuthToken) -> Result<Session, TransportError>;
}

/// WebSocket transport over tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
    health_url: String,
    http: reqwest::Client,
}

impl WsTransport {
    pub fn new(url: impl Into<String>, health_url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            health_url: health_url.into(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl RealtimeTransport for WsTransport {
    async fn probe(&self) -> Result<(), TransportError> {
        let response = self
            .http
            .get(&self.health_url)
            .send()
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TransportError::Unreachable(format!(
                "health check returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn open(&self, token: &AuthToken) -> Result<Session, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", token.secret()))
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| match e {
                WsError::Http(response)
                    if response.status() == StatusCode::UNAUTHORIZED
                        || response.status() == StatusCode::FORBIDDEN =>
                {
                    TransportError::Unauthorized
                }
                other => TransportError::Handshake(other.to_string()),
            })?;

        let (session, peer) = Session::channel();
        tokio::spawn(drive(ws, peer));
        Ok(session)
    }
}

/// Pump one socket until either side closes it.
async fn drive<S>(ws: tokio_tungstenite::WebSocketStream<S>, mut peer: SessionPeer)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_sender, mut ws_receiver) = ws.split();

    let reason = loop {
        tokio::select! {
            _ = peer.shutdown.cancelled() => {
                let _ = ws_sender.send(Message::Close(None)).await;
                break DisconnectReason::ClientDisconnect;
            }
            outbound = peer.outbound.recv() => {
                let Some(message) = outbound else {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break DisconnectReason::ClientDisconnect;
                };
                match serde_json::to_string(&message) {
                    Ok(text) => {
                        if let Err(e) = ws_sender.send(Message::Text(text)).await {
                            tracing::warn!("Failed to send realtime message: {}", e);
                            break DisconnectReason::TransportError;
                        }
                    }
                    Err(e) => tracing::error!("Failed to serialize realtime message: {}", e),
                }
            }
            inbound = ws_receiver.next() => match inbound {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(message) => {
                        let _ = peer.events.send(TransportEvent::Message(message));
                    }
                    Err(e) => tracing::warn!("Ignoring malformed realtime message: {}", e),
                },
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!(?frame, "Realtime close frame received");
                    break match frame {
                        Some(frame)
                            if matches!(
                                frame.code,
                                CloseCode::Normal | CloseCode::Away | CloseCode::Policy
                            ) =>
                        {
                            DisconnectReason::ServerDisconnect
                        }
                        _ => DisconnectReason::TransportClose,
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!("Realtime socket error: {}", e);
                    break DisconnectReason::TransportError;
                }
                None => break DisconnectReason::TransportClose,
            },
        }
    };

    let _ = peer.events.send(TransportEvent::Closed(reason));
}
