//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real server and connect real clients,
//! verifying the lock, commit and broadcast pipeline.

use std::sync::Arc;
use std::time::Instant;

use folio_collab::client::{ClientConfig, ClientEvent, CollabClient, ConnectionState};
use folio_collab::hub::Hub;
use folio_collab::model::{BlockType, DocumentId, SessionId};
use folio_collab::protocol::{ClientMessage, ServerMessage};
use folio_collab::server::{CollabServer, ServerConfig};
use folio_collab::storage::MemoryStore;
use folio_collab::sync::{LockState, SyncEngine};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a server on a free port, return the port and its hub.
async fn start_test_server(config: ServerConfig) -> (u16, Arc<Hub>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = CollabServer::with_store(config, Arc::new(MemoryStore::new()));
    let hub = server.hub().clone();
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    (port, hub)
}

async fn default_server() -> (u16, Arc<Hub>) {
    start_test_server(ServerConfig {
        broadcast_capacity: 64,
        ..ServerConfig::default()
    })
    .await
}

struct TestClient {
    ws: Ws,
    session_id: SessionId,
}

impl TestClient {
    async fn connect(port: u16, name: &str) -> Self {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}"))
            .await
            .unwrap();
        let mut client = Self {
            ws,
            session_id: SessionId::nil(),
        };
        match client.recv().await {
            ServerMessage::SessionAck { session_id, .. } => client.session_id = session_id,
            other => panic!("expected session_ack, got {other:?}"),
        }
        client
            .send(ClientMessage::SetUsername {
                username: name.into(),
            })
            .await;
        match client.recv().await {
            ServerMessage::SessionAck { username, .. } => assert_eq!(username, name),
            other => panic!("expected session_ack, got {other:?}"),
        }
        client
    }

    async fn send(&mut self, message: ClientMessage) {
        let text = message.encode().unwrap();
        self.ws.send(Message::Text(text.into())).await.unwrap();
    }

    async fn recv(&mut self) -> ServerMessage {
        loop {
            let frame = timeout(Duration::from_secs(2), self.ws.next())
                .await
                .expect("timed out waiting for a message")
                .expect("connection closed")
                .unwrap();
            if let Message::Text(text) = frame {
                return ServerMessage::decode(text.as_str()).unwrap();
            }
        }
    }

    /// Skip messages until one of `kind` arrives.
    async fn recv_kind(&mut self, kind: &str) -> ServerMessage {
        loop {
            let message = self.recv().await;
            if message.kind() == kind {
                return message;
            }
        }
    }

    /// Everything that arrives within `window`.
    async fn collect(&mut self, window: Duration) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(Some(Ok(frame))) = timeout(window, self.ws.next()).await {
            if let Message::Text(text) = frame {
                out.push(ServerMessage::decode(text.as_str()).unwrap());
            }
        }
        out
    }

    /// Open a document and return its block ids in order.
    async fn open(&mut self, document_id: DocumentId) -> Vec<String> {
        self.send(ClientMessage::OpenDocument { document_id }).await;
        match self.recv_kind("document_snapshot").await {
            ServerMessage::DocumentSnapshot { blocks, .. } => {
                blocks.into_iter().map(|b| b.block_id).collect()
            }
            _ => unreachable!(),
        }
    }
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (port, hub) = default_server().await;
    let client = TestClient::connect(port, "Ann").await;
    assert_ne!(client.session_id, SessionId::nil());
    assert_eq!(hub.session_count().await, 1);
}

#[tokio::test]
async fn test_edit_release_then_second_editor() {
    let (port, hub) = default_server().await;
    let doc = hub.create_document("Notes", None).await.unwrap().document_id;

    let mut ann = TestClient::connect(port, "Ann").await;
    let b1 = ann.open(doc).await.remove(0);

    ann.send(ClientMessage::LockBlock {
        document_id: doc,
        block_id: b1.clone(),
    })
    .await;
    match ann.recv_kind("block_locked").await {
        ServerMessage::BlockLocked { locked_by, .. } => assert_eq!(locked_by, "Ann"),
        _ => unreachable!(),
    }
    ann.send(ClientMessage::UpdateDocument {
        document_id: doc,
        block_id: b1.clone(),
        content: "Hello".into(),
        metadata: Default::default(),
    })
    .await;
    match ann.recv_kind("document_updated").await {
        ServerMessage::DocumentUpdated { version_id, .. } => assert_eq!(version_id, 1),
        _ => unreachable!(),
    }
    ann.send(ClientMessage::UnlockBlock {
        document_id: doc,
        block_id: b1.clone(),
    })
    .await;
    ann.recv_kind("block_unlocked").await;

    let mut bob = TestClient::connect(port, "Bob").await;
    bob.send(ClientMessage::OpenDocument { document_id: doc }).await;
    match bob.recv_kind("document_snapshot").await {
        ServerMessage::DocumentSnapshot {
            blocks,
            locks,
            latest_version,
            ..
        } => {
            assert_eq!(blocks[0].content, "Hello");
            assert!(locks.is_empty());
            assert_eq!(latest_version, 1);
        }
        _ => unreachable!(),
    }
    bob.send(ClientMessage::LockBlock {
        document_id: doc,
        block_id: b1.clone(),
    })
    .await;
    bob.recv_kind("block_locked").await;
    bob.send(ClientMessage::UpdateDocument {
        document_id: doc,
        block_id: b1.clone(),
        content: "Hello World".into(),
        metadata: Default::default(),
    })
    .await;
    match bob.recv_kind("document_updated").await {
        ServerMessage::DocumentUpdated {
            version_id,
            content_html,
            ..
        } => {
            assert_eq!(version_id, 2);
            assert_eq!(content_html, "Hello World");
        }
        _ => unreachable!(),
    }

    // Ann is still in the room and sees Bob's commit
    match ann.recv_kind("document_updated").await {
        ServerMessage::DocumentUpdated {
            updated_by,
            session_id,
            ..
        } => {
            assert_eq!(updated_by, "Bob");
            assert_eq!(session_id, bob.session_id);
        }
        _ => unreachable!(),
    }

    bob.send(ClientMessage::GetVersion {
        document_id: doc,
        version_id: 1,
    })
    .await;
    match bob.recv_kind("version").await {
        ServerMessage::Version { version } => {
            assert_eq!(version.content, "Hello");
            assert_eq!(version.changed_by, "Ann");
        }
        _ => unreachable!(),
    }

    bob.send(ClientMessage::GetHistory { document_id: doc }).await;
    match bob.recv_kind("history").await {
        ServerMessage::History { versions, .. } => {
            let ids: Vec<u64> = versions.iter().map(|v| v.version_id).collect();
            assert_eq!(ids, vec![2, 1]);
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_simultaneous_lock_requests() {
    let (port, hub) = default_server().await;
    let doc = hub.create_document("Race", None).await.unwrap().document_id;
    let mut ann = TestClient::connect(port, "Ann").await;
    let mut bob = TestClient::connect(port, "Bob").await;
    let b2 = ann.open(doc).await.remove(0);
    bob.open(doc).await;

    let lock = ClientMessage::LockBlock {
        document_id: doc,
        block_id: b2.clone(),
    };
    tokio::join!(ann.send(lock.clone()), bob.send(lock));

    let window = Duration::from_millis(300);
    let (seen_by_ann, seen_by_bob) = tokio::join!(ann.collect(window), bob.collect(window));

    let granted: Vec<(String, SessionId)> = seen_by_ann
        .iter()
        .filter_map(|m| match m {
            ServerMessage::BlockLocked {
                locked_by,
                session_id,
                ..
            } => Some((locked_by.clone(), *session_id)),
            _ => None,
        })
        .collect();
    assert_eq!(granted.len(), 1, "exactly one grant: {seen_by_ann:?}");
    let (winner_name, winner) = granted[0].clone();

    let denied: Vec<(&str, &String)> = [("Ann", &seen_by_ann), ("Bob", &seen_by_bob)]
        .into_iter()
        .flat_map(|(who, seen)| {
            seen.iter().filter_map(move |m| match m {
                ServerMessage::LockDenied { locked_by, .. } => Some((who, locked_by)),
                _ => None,
            })
        })
        .collect();
    assert_eq!(denied.len(), 1, "exactly one denial");
    assert_eq!(denied[0].1, &winner_name);
    assert_ne!(denied[0].0, winner_name, "the winner is not denied");

    let loser = if winner == ann.session_id { "Bob" } else { "Ann" };
    assert_eq!(denied[0].0, loser);
}

#[tokio::test]
async fn test_add_table_yields_grid() {
    let (port, hub) = default_server().await;
    let doc = hub.create_document("Tables", None).await.unwrap().document_id;
    let mut ann = TestClient::connect(port, "Ann").await;
    let first = ann.open(doc).await.remove(0);

    ann.send(ClientMessage::AddBlock {
        document_id: doc,
        block_type: BlockType::Table,
        after_block_id: Some(first.clone()),
    })
    .await;
    let added = match ann.recv_kind("block_added").await {
        ServerMessage::BlockAdded {
            added_blocks,
            after_block_id,
            ..
        } => {
            assert_eq!(after_block_id, Some(first));
            added_blocks
        }
        _ => unreachable!(),
    };
    let count = |t: BlockType| added.iter().filter(|b| b.block_type == t).count();
    assert_eq!(count(BlockType::Table), 1);
    assert_eq!(count(BlockType::TableOptions), 1);
    assert_eq!(count(BlockType::TableCell), 4);

    let table_id = added
        .iter()
        .find(|b| b.block_type == BlockType::Table)
        .map(|b| b.block_id.clone())
        .unwrap();
    let mut coords: Vec<(u32, u32)> = added
        .iter()
        .filter(|b| b.block_type == BlockType::TableCell)
        .map(|b| {
            assert_eq!(b.parent_block_id.as_deref(), Some(table_id.as_str()));
            (b.row_index.unwrap(), b.col_index.unwrap())
        })
        .collect();
    coords.sort();
    assert_eq!(coords, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);

    ann.send(ClientMessage::AddTableRow {
        document_id: doc,
        table_id: table_id.clone(),
        after_row_index: Some(0),
    })
    .await;
    match ann.recv_kind("table_row_added").await {
        ServerMessage::TableRowAdded {
            row_index,
            added_blocks,
            shifted,
            ..
        } => {
            assert_eq!(row_index, 1);
            assert_eq!(added_blocks.len(), 2);
            assert_eq!(shifted.len(), 2);
        }
        _ => unreachable!(),
    }

    ann.send(ClientMessage::DeleteBlock {
        document_id: doc,
        block_id: table_id,
    })
    .await;
    match ann.recv_kind("block_deleted").await {
        ServerMessage::BlockDeleted {
            removed_block_ids, ..
        } => assert_eq!(removed_block_ids.len(), 8),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_disconnect_releases_locks() {
    let (port, hub) = default_server().await;
    let doc = hub.create_document("Drop", None).await.unwrap().document_id;
    let mut ann = TestClient::connect(port, "Ann").await;
    let mut bob = TestClient::connect(port, "Bob").await;
    let b1 = ann.open(doc).await.remove(0);
    bob.open(doc).await;

    ann.send(ClientMessage::LockBlock {
        document_id: doc,
        block_id: b1.clone(),
    })
    .await;
    bob.recv_kind("block_locked").await;

    ann.ws.close(None).await.unwrap();
    drop(ann);

    match bob.recv_kind("block_unlocked").await {
        ServerMessage::BlockUnlocked {
            block_id,
            unlocked_by,
            ..
        } => {
            assert_eq!(block_id, b1);
            assert_eq!(unlocked_by, "Ann");
        }
        _ => unreachable!(),
    }

    bob.send(ClientMessage::LockBlock {
        document_id: doc,
        block_id: b1,
    })
    .await;
    match bob.recv_kind("block_locked").await {
        ServerMessage::BlockLocked { session_id, .. } => assert_eq!(session_id, bob.session_id),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_update_without_lock_is_rejected() {
    let (port, hub) = default_server().await;
    let doc = hub.create_document("Guarded", None).await.unwrap().document_id;
    let mut ann = TestClient::connect(port, "Ann").await;
    let b1 = ann.open(doc).await.remove(0);

    ann.send(ClientMessage::UpdateDocument {
        document_id: doc,
        block_id: b1,
        content: "sneaky".into(),
        metadata: Default::default(),
    })
    .await;
    match ann.recv_kind("error").await {
        ServerMessage::Error { error_code, .. } => assert_eq!(error_code, "not_lock_holder"),
        _ => unreachable!(),
    }

    ann.send(ClientMessage::GetHistory { document_id: doc }).await;
    match ann.recv_kind("history").await {
        ServerMessage::History { versions, .. } => assert!(versions.is_empty()),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_malformed_message_keeps_connection() {
    let (port, _hub) = default_server().await;
    let mut ann = TestClient::connect(port, "Ann").await;

    ann.ws
        .send(Message::Text("{\"type\":\"nonsense\"}".into()))
        .await
        .unwrap();
    ann.ws.send(Message::Text("not json".into())).await.unwrap();
    ann.send(ClientMessage::Heartbeat {
        client_time: Some(1),
    })
    .await;
    match ann.recv().await {
        ServerMessage::HeartbeatAck { server_time } => assert!(server_time > 0),
        other => panic!("expected heartbeat_ack, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unknown_document_reports_not_found() {
    let (port, _hub) = default_server().await;
    let mut ann = TestClient::connect(port, "Ann").await;
    ann.send(ClientMessage::OpenDocument {
        document_id: DocumentId::new_v4(),
    })
    .await;
    match ann.recv().await {
        ServerMessage::Error { error_code, .. } => assert_eq!(error_code, "not_found"),
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_silent_session_is_swept() {
    let (port, hub) = start_test_server(ServerConfig {
        heartbeat_interval_secs: 1,
        heartbeat_timeout_secs: 1,
        ..ServerConfig::default()
    })
    .await;
    let doc = hub.create_document("Sweep", None).await.unwrap().document_id;
    let mut ann = TestClient::connect(port, "Ann").await;
    let b1 = ann.open(doc).await.remove(0);
    ann.send(ClientMessage::LockBlock {
        document_id: doc,
        block_id: b1,
    })
    .await;
    ann.recv_kind("block_locked").await;

    let closed = timeout(Duration::from_secs(5), async {
        loop {
            match ann.ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                _ => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "server should close a silent session");
    assert_eq!(hub.session_count().await, 0);
    let room = hub.rooms().get(doc).await.unwrap();
    match room.snapshot().await.unwrap() {
        ServerMessage::DocumentSnapshot { locks, .. } => assert!(locks.is_empty()),
        _ => unreachable!(),
    }
}

async fn next_message(events: &mut mpsc::Receiver<ClientEvent>, kind: &str) -> ServerMessage {
    loop {
        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for a client event")
            .expect("client stopped");
        if let ClientEvent::Message(message) = event {
            if message.kind() == kind {
                return message;
            }
        }
    }
}

#[tokio::test]
async fn test_client_and_sync_engine_round_trip() {
    let (port, hub) = default_server().await;
    let doc = hub.create_document("Engine", None).await.unwrap().document_id;

    let config = ClientConfig::new(format!("ws://127.0.0.1:{port}")).with_username("Ann");
    let (client, mut events) = CollabClient::start(config);
    let mut engine = SyncEngine::default();

    // server ack first, then the ack for the announced username
    let ack = loop {
        let ack = next_message(&mut events, "session_ack").await;
        if matches!(&ack, ServerMessage::SessionAck { username, .. } if username == "Ann") {
            break ack;
        }
    };
    assert_eq!(client.connection_state().await, ConnectionState::Connected);
    engine.apply(&ack);

    engine.open(doc);
    for message in engine.drain_outgoing() {
        client.send(message).await.unwrap();
    }
    let snapshot = next_message(&mut events, "document_snapshot").await;
    engine.apply(&snapshot);
    let ServerMessage::DocumentSnapshot { blocks, .. } = snapshot else {
        unreachable!()
    };
    let b1 = blocks[0].block_id.clone();

    engine.focus(&b1).unwrap();
    for message in engine.drain_outgoing() {
        client.send(message).await.unwrap();
    }
    engine.apply(&next_message(&mut events, "block_locked").await);
    assert_eq!(engine.lock_state(&b1), Some(&LockState::Held));

    engine.edit(&b1, "Hello", Instant::now()).unwrap();
    engine.blur(&b1).unwrap();
    for message in engine.drain_outgoing() {
        client.send(message).await.unwrap();
    }
    engine.apply(&next_message(&mut events, "document_updated").await);
    engine.apply(&next_message(&mut events, "block_unlocked").await);
    assert_eq!(engine.lock_state(&b1), Some(&LockState::Released));
    assert_eq!(engine.content(&b1), Some("Hello"));

    let room = hub.rooms().get(doc).await.unwrap();
    assert_eq!(room.version(1).await.unwrap().content, "Hello");

    client.close();
}
