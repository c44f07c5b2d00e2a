//! WebSocket collaboration server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                     ┌── LockManager
//!             ├── Hub ── Room (doc) ┼── DocumentLog ── Storage (RocksDB | memory)
//! Client B ──┘    │                 └── BroadcastGroup
//!                 │                          │
//!           SessionRegistry       ┌──────────┼───────────┐
//!                                 ▼          ▼           ▼
//!                              Client A   Client B    Client C
//! ```
//!
//! Each connection task owns one session. It decodes `{type, payload}` text
//! frames, routes them through the hub to the document room, and forwards
//! the room's broadcast events for its audience. A background sweeper closes
//! sessions whose heartbeats stop.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, oneshot, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::Envelope;
use crate::error::Result;
use crate::hub::Hub;
use crate::model::{now_millis, DocumentId, Participant};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::room::RoomHandle;
use crate::session::ConnectionId;
use crate::storage::{import_templates, MemoryStore, RocksStore, Storage, StoreConfig};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per document room
    pub broadcast_capacity: usize,
    /// How often the sweeper looks for silent sessions, in seconds
    pub heartbeat_interval_secs: u64,
    /// A session with no heartbeat for this long is disconnected
    pub heartbeat_timeout_secs: u64,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Directory of `*.json` templates imported at startup
    pub template_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            heartbeat_interval_secs: 5,
            heartbeat_timeout_secs: 15,
            storage_path: None,
            template_dir: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub malformed_messages: u64,
    pub active_rooms: usize,
}

/// The collaboration server.
pub struct CollabServer {
    config: ServerConfig,
    hub: Arc<Hub>,
    stats: Arc<RwLock<ServerStats>>,
}

impl CollabServer {
    /// Create a server, opening RocksDB when `storage_path` is set and
    /// importing templates from `template_dir`.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let store: Arc<dyn Storage> = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                Arc::new(RocksStore::open(store_config)?)
            }
            None => Arc::new(MemoryStore::new()),
        };
        if let Some(dir) = &config.template_dir {
            let imported = import_templates(dir, store.as_ref())?;
            log::info!("Imported {} templates from {}", imported.len(), dir.display());
        }
        Ok(Self::with_store(config, store))
    }

    /// Create a server over an existing store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn Storage>) -> Self {
        let hub = Arc::new(Hub::new(store, config.broadcast_capacity));
        Self {
            config,
            hub,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        TcpListener::bind(&self.config.bind_addr).await
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> std::result::Result<(), BoxError> {
        let listener = self.bind().await?;
        log::info!("Collaboration server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::result::Result<(), BoxError> {
        let sweeper = self.spawn_sweeper();

        let result = loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(e.into()),
            };
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        };

        sweeper.abort();
        result
    }

    fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let hub = self.hub.clone();
        let every = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));
        let timeout = Duration::from_secs(self.config.heartbeat_timeout_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let expired = hub.sweep_expired(timeout).await;
                if !expired.is_empty() {
                    log::info!("Swept {} silent sessions", expired.len());
                }
            }
        })
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: Arc<Hub>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> std::result::Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (closer, mut kicked) = oneshot::channel();
        let who = hub.register(ConnectionId::next(), None, Some(closer)).await?;
        log::info!(
            "WebSocket connection from {addr} is session {} ('{}')",
            who.session_id,
            who.display_name
        );

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut conn = Connection {
            hub: hub.clone(),
            who,
            room: None,
            events: None,
        };
        let ack = ServerMessage::SessionAck {
            session_id: conn.who.session_id,
            username: conn.who.display_name.clone(),
        };

        let result = async {
            ws_sender.send(Message::Text(ack.encode()?.into())).await?;

            loop {
                tokio::select! {
                    // Incoming WebSocket message
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                {
                                    let mut s = stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += text.len() as u64;
                                }
                                let request = match ClientMessage::decode(text.as_str()) {
                                    Ok(request) => request,
                                    Err(e) => {
                                        log::warn!("Ignoring malformed message from {addr}: {e}");
                                        stats.write().await.malformed_messages += 1;
                                        continue;
                                    }
                                };
                                let reply = match conn.dispatch(request).await {
                                    Ok(reply) => reply,
                                    Err(e) => {
                                        log::debug!("Request from '{}' failed: {e}", conn.who.display_name);
                                        Some(ServerMessage::error(e.code(), e.to_string()))
                                    }
                                };
                                if let Some(reply) = reply {
                                    ws_sender.send(Message::Text(reply.encode()?.into())).await?;
                                }
                            }

                            Some(Ok(Message::Binary(_))) => {
                                log::warn!("Ignoring binary frame from {addr}");
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    // Outgoing room event
                    event = async {
                        match conn.events.as_mut() {
                            Some(rx) => rx.recv().await,
                            // Not in a document yet
                            None => std::future::pending().await,
                        }
                    } => {
                        match event {
                            Ok(envelope) => {
                                if envelope.audience.includes(conn.who.session_id) {
                                    ws_sender.send(Message::Text(envelope.encoded.clone().into())).await?;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("Session {} lagged by {n} events", conn.who.session_id);
                                if let Some(room) = &conn.room {
                                    room.broadcast().record_dropped(n);
                                }
                                let notice = ServerMessage::error(
                                    "lagged",
                                    format!("{n} events were dropped; reopen the document"),
                                );
                                ws_sender.send(Message::Text(notice.encode()?.into())).await?;
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                conn.events = None;
                            }
                        }
                    }

                    // Server-side disconnect
                    reason = &mut kicked => {
                        if let Ok(reason) = reason {
                            log::info!("Disconnecting session {}: {reason}", conn.who.session_id);
                        }
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            Ok::<(), BoxError>(())
        }
        .await;

        hub.disconnect(conn.who.session_id, conn.room.as_ref()).await;
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }

        result
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.hub.rooms().room_count().await;
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

/// Per-connection routing state.
struct Connection {
    hub: Arc<Hub>,
    who: Participant,
    room: Option<RoomHandle>,
    events: Option<broadcast::Receiver<Arc<Envelope>>>,
}

impl Connection {
    /// Make `document_id` current, switching the event receiver when the
    /// session newly joins. Returns the join snapshot in that case.
    async fn enter(&mut self, document_id: DocumentId) -> Result<(RoomHandle, Option<ServerMessage>)> {
        let (room, joined) = self
            .hub
            .enter_document(self.who.session_id, document_id)
            .await?;
        let snapshot = joined.map(|joined| {
            self.events = Some(joined.receiver);
            self.room = Some(room.clone());
            joined.snapshot
        });
        Ok((room, snapshot))
    }

    /// Route one request. Returns the direct reply, if the request has one;
    /// everything else reaches the client through the room's broadcast.
    async fn dispatch(&mut self, request: ClientMessage) -> Result<Option<ServerMessage>> {
        let who = self.who.clone();
        let room = match request.document_id() {
            None => None,
            Some(document_id) => Some(self.enter(document_id).await?),
        };

        let reply = match (request, room) {
            (ClientMessage::SetUsername { username }, _) => {
                self.who = self.hub.rename(who.session_id, &username).await?;
                Some(ServerMessage::SessionAck {
                    session_id: self.who.session_id,
                    username: self.who.display_name.clone(),
                })
            }
            (ClientMessage::Heartbeat { .. }, _) => {
                self.hub.heartbeat(who.session_id).await?;
                Some(ServerMessage::HeartbeatAck {
                    server_time: now_millis(),
                })
            }
            (ClientMessage::OpenDocument { .. }, Some((room, snapshot))) => match snapshot {
                Some(snapshot) => Some(snapshot),
                None => Some(room.snapshot().await?),
            },
            (ClientMessage::LockBlock { block_id, .. }, Some((room, _))) => {
                room.acquire(who, block_id).await?;
                None
            }
            (ClientMessage::UnlockBlock { block_id, .. }, Some((room, _))) => {
                room.release(who, block_id).await?;
                None
            }
            (
                ClientMessage::UpdateDocument {
                    block_id,
                    content,
                    metadata,
                    ..
                },
                Some((room, _)),
            ) => {
                room.commit(who, block_id, content, metadata).await?;
                None
            }
            (
                ClientMessage::AddBlock {
                    block_type,
                    after_block_id,
                    ..
                },
                Some((room, _)),
            ) => {
                room.add_block(who, block_type, after_block_id).await?;
                None
            }
            (ClientMessage::DeleteBlock { block_id, .. }, Some((room, _))) => {
                room.delete_block(who, block_id).await?;
                None
            }
            (
                ClientMessage::UpdateTableOptions {
                    table_id,
                    options_json,
                    ..
                },
                Some((room, _)),
            ) => {
                room.update_table_options(who, table_id, options_json).await?;
                None
            }
            (
                ClientMessage::AddTableRow {
                    table_id,
                    after_row_index,
                    ..
                },
                Some((room, _)),
            ) => {
                room.add_table_row(who, table_id, after_row_index).await?;
                None
            }
            (ClientMessage::GetHistory { document_id }, Some((room, _))) => {
                Some(ServerMessage::History {
                    document_id,
                    versions: room.history().await?,
                })
            }
            (ClientMessage::GetVersion { version_id, .. }, Some((room, _))) => {
                Some(ServerMessage::Version {
                    version: room.version(version_id).await?,
                })
            }
            // Every document-scoped request has a room by now.
            (_, None) => None,
        };
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.heartbeat_interval_secs, 5);
        assert_eq!(config.heartbeat_timeout_secs, 15);
        assert!(config.storage_path.is_none());
        assert!(config.template_dir.is_none());
    }

    #[test]
    fn test_server_creation() {
        let server = CollabServer::new(ServerConfig::default()).unwrap();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
    }

    #[tokio::test]
    async fn test_server_with_storage_and_templates() {
        let dir = tempfile::tempdir().unwrap();
        let templates = dir.path().join("templates");
        std::fs::create_dir(&templates).unwrap();
        std::fs::write(
            templates.join("report.json"),
            r#"[{"block_type":"heading","content":"Report"},{"block_type":"text","content":"Body"}]"#,
        )
        .unwrap();

        let config = ServerConfig {
            storage_path: Some(dir.path().join("db")),
            template_dir: Some(templates),
            ..ServerConfig::default()
        };
        let server = CollabServer::new(config).unwrap();
        assert_eq!(server.hub().list_templates().await.unwrap(), vec!["report"]);
        let doc = server
            .hub()
            .create_document("Q3", Some("report"))
            .await
            .unwrap();
        assert_eq!(server.hub().list_documents().await.unwrap()[0], doc);
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = CollabServer::with_store(ServerConfig::default(), Arc::new(MemoryStore::new()));
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.active_rooms, 0);
    }

    #[tokio::test]
    async fn test_dispatch_without_document() {
        let hub = Arc::new(Hub::new(Arc::new(MemoryStore::new()), 16));
        let who = hub.register(ConnectionId(900), None, None).await.unwrap();
        let mut conn = Connection {
            hub: hub.clone(),
            who,
            room: None,
            events: None,
        };

        let reply = conn
            .dispatch(ClientMessage::SetUsername {
                username: "Ann".into(),
            })
            .await
            .unwrap();
        assert!(matches!(reply, Some(ServerMessage::SessionAck { ref username, .. }) if username == "Ann"));
        assert_eq!(conn.who.display_name, "Ann");

        let reply = conn
            .dispatch(ClientMessage::Heartbeat { client_time: None })
            .await
            .unwrap();
        assert!(matches!(reply, Some(ServerMessage::HeartbeatAck { .. })));

        let err = conn
            .dispatch(ClientMessage::OpenDocument {
                document_id: uuid::Uuid::new_v4(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
        assert!(conn.events.is_none());
    }

    #[tokio::test]
    async fn test_implicit_join_installs_receiver() {
        let hub = Arc::new(Hub::new(Arc::new(MemoryStore::new()), 16));
        let doc = hub.create_document("Doc", None).await.unwrap();
        let who = hub.register(ConnectionId(901), None, None).await.unwrap();
        let mut conn = Connection {
            hub: hub.clone(),
            who,
            room: None,
            events: None,
        };

        let reply = conn
            .dispatch(ClientMessage::GetHistory {
                document_id: doc.document_id,
            })
            .await
            .unwrap();
        assert!(matches!(reply, Some(ServerMessage::History { ref versions, .. }) if versions.is_empty()));
        assert!(conn.events.is_some());

        let reply = conn
            .dispatch(ClientMessage::OpenDocument {
                document_id: doc.document_id,
            })
            .await
            .unwrap();
        assert!(matches!(reply, Some(ServerMessage::DocumentSnapshot { .. })));
    }
}
