//! WebSocket client for the collaboration server.
//!
//! Provides:
//! - A supervisor task owning the connection lifecycle
//! - Username (re-)announcement and periodic heartbeats
//! - Bounded reconnection with exponential backoff
//!
//! There is no offline queue: sending while disconnected fails with
//! `ConnectionLost` and the caller decides what to do.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::{CollabError, Result};
use crate::model::now_millis;
use crate::protocol::{ClientMessage, ServerMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Retry ceiling reached. Terminal.
    Failed,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    Message(ServerMessage),
    /// The reconnect policy ran out of attempts.
    GaveUp,
}

/// Bounded retry state: attempt counter, ceiling and computed delay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    attempt: u32,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(500), Duration::from_secs(10))
    }
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Attempts used since the last successful connection.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt, doubling each time up to `max_delay`.
    /// `None` once `max_attempts` have been used.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        let delay = self
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);
        self.attempt += 1;
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server URL, e.g. `ws://127.0.0.1:9090`
    pub url: String,
    /// Announced with `set_username` after every (re)connect
    pub username: Option<String>,
    pub heartbeat_interval: Duration,
    pub reconnect: ReconnectPolicy,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            heartbeat_interval: Duration::from_secs(5),
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }
}

/// Handle to a running client. Dropping it stops the supervisor.
pub struct CollabClient {
    state: Arc<RwLock<ConnectionState>>,
    /// Writer channel of the live connection, if any.
    link: Arc<RwLock<Option<mpsc::Sender<String>>>>,
    username: Arc<RwLock<Option<String>>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl CollabClient {
    /// Spawn the supervisor and return the handle plus its event stream.
    pub fn start(config: ClientConfig) -> (Self, mpsc::Receiver<ClientEvent>) {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (shutdown, shutdown_rx) = oneshot::channel();

        let client = Self {
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            link: Arc::new(RwLock::new(None)),
            username: Arc::new(RwLock::new(config.username.clone())),
            shutdown: Some(shutdown),
        };

        let supervisor = Supervisor {
            url: config.url,
            heartbeat_interval: config.heartbeat_interval,
            policy: config.reconnect,
            state: client.state.clone(),
            link: client.link.clone(),
            username: client.username.clone(),
            events: event_tx,
        };
        tokio::spawn(supervisor.run(shutdown_rx));

        (client, event_rx)
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Send a message over the live connection.
    pub async fn send(&self, message: ClientMessage) -> Result<()> {
        if let ClientMessage::SetUsername { username } = &message {
            *self.username.write().await = Some(username.clone());
        }
        let encoded = message.encode()?;
        let link = self.link.read().await.clone();
        match link {
            Some(tx) => tx
                .send(encoded)
                .await
                .map_err(|_| CollabError::ConnectionLost),
            None => Err(CollabError::ConnectionLost),
        }
    }

    /// Stop the supervisor and close the connection.
    pub fn close(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How one connection ended.
enum Ended {
    Lost,
    Shutdown,
}

struct Supervisor {
    url: String,
    heartbeat_interval: Duration,
    policy: ReconnectPolicy,
    state: Arc<RwLock<ConnectionState>>,
    link: Arc<RwLock<Option<mpsc::Sender<String>>>>,
    username: Arc<RwLock<Option<String>>>,
    events: mpsc::Sender<ClientEvent>,
}

impl Supervisor {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        loop {
            let attempt = self.policy.attempt();
            *self.state.write().await = if attempt == 0 {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting { attempt }
            };

            let connected = tokio::select! {
                result = tokio_tungstenite::connect_async(self.url.as_str()) => result,
                _ = &mut shutdown => break,
            };
            match connected {
                Ok((ws_stream, _)) => {
                    self.policy.reset();
                    log::info!("Connected to {}", self.url);
                    if let Ended::Shutdown = self.session(ws_stream, &mut shutdown).await {
                        break;
                    }
                    log::warn!("Connection to {} lost", self.url);
                }
                Err(e) => {
                    log::warn!("Failed to connect to {}: {e}", self.url);
                }
            }

            let Some(delay) = self.policy.next_delay() else {
                log::error!(
                    "Giving up on {} after {} attempts",
                    self.url,
                    self.policy.max_attempts
                );
                *self.state.write().await = ConnectionState::Failed;
                let _ = self.events.send(ClientEvent::GaveUp).await;
                return;
            };
            *self.state.write().await = ConnectionState::Reconnecting {
                attempt: self.policy.attempt(),
            };
            log::debug!("Reconnecting in {delay:?}");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = &mut shutdown => break,
            }
        }

        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Drive one live connection until it drops or shutdown is requested.
    async fn session(&mut self, ws_stream: WsStream, shutdown: &mut oneshot::Receiver<()>) -> Ended {
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);

        // Re-announce before the link opens so it precedes queued sends.
        let username = self.username.read().await.clone();
        if let Some(username) = username {
            let announce = ClientMessage::SetUsername { username };
            if let Ok(encoded) = announce.encode() {
                if ws_writer.send(Message::Text(encoded.into())).await.is_err() {
                    return Ended::Lost;
                }
            }
        }

        *self.link.write().await = Some(out_tx);
        *self.state.write().await = ConnectionState::Connected;
        let _ = self.events.send(ClientEvent::Connected).await;

        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.tick().await;

        let ended = loop {
            tokio::select! {
                outgoing = out_rx.recv() => {
                    let Some(text) = outgoing else { break Ended::Lost };
                    if ws_writer.send(Message::Text(text.into())).await.is_err() {
                        break Ended::Lost;
                    }
                }

                _ = heartbeat.tick() => {
                    let beat = ClientMessage::Heartbeat { client_time: Some(now_millis()) };
                    if let Ok(encoded) = beat.encode() {
                        if ws_writer.send(Message::Text(encoded.into())).await.is_err() {
                            break Ended::Lost;
                        }
                    }
                }

                incoming = ws_reader.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => match ServerMessage::decode(text.as_str()) {
                            Ok(message) => {
                                let _ = self.events.send(ClientEvent::Message(message)).await;
                            }
                            Err(e) => log::warn!("Ignoring malformed server message: {e}"),
                        },
                        Some(Ok(Message::Close(_))) | None => break Ended::Lost,
                        Some(Err(e)) => {
                            log::warn!("WebSocket error: {e}");
                            break Ended::Lost;
                        }
                        _ => {}
                    }
                }

                _ = &mut *shutdown => {
                    let _ = ws_writer.send(Message::Close(None)).await;
                    break Ended::Shutdown;
                }
            }
        };

        *self.link.write().await = None;
        *self.state.write().await = ConnectionState::Disconnected;
        let _ = self.events.send(ClientEvent::Disconnected).await;
        ended
    }
}
