//! Per-document event fan-out.
//!
//! One tokio broadcast channel per document room. Every member's connection
//! task holds a receiver; events are encoded once and shared as
//! `Arc<Envelope>`. Events addressed to a single session travel the same
//! channel and are filtered by the receiving task, so a session sees its own
//! replies and everyone's events in one order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::model::{Participant, SessionId};
use crate::protocol::{ProtocolError, ServerMessage};

/// Who an event is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    All,
    Session(SessionId),
}

impl Audience {
    pub fn includes(&self, session_id: SessionId) -> bool {
        match self {
            Audience::All => true,
            Audience::Session(target) => *target == session_id,
        }
    }
}

/// A server event with its wire encoding.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub audience: Audience,
    pub message: ServerMessage,
    pub encoded: String,
}

impl Envelope {
    pub fn new(audience: Audience, message: ServerMessage) -> Result<Self, ProtocolError> {
        let encoded = message.encode()?;
        Ok(Self {
            audience,
            message,
            encoded,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_members: usize,
}

/// Counters kept off the members lock.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Envelope>>,
    members: RwLock<HashMap<SessionId, String>>,
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` is how many events a receiver may fall behind before it lags.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            members: RwLock::new(HashMap::new()),
            capacity,
            atomic_stats: AtomicBroadcastStats::default(),
        }
    }

    /// Add a member and hand back its receiver. Re-joining replaces the name.
    pub async fn join(&self, who: &Participant) -> broadcast::Receiver<Arc<Envelope>> {
        let mut members = self.members.write().await;
        members.insert(who.session_id, who.display_name.clone());
        self.sender.subscribe()
    }

    pub async fn leave(&self, session_id: SessionId) -> bool {
        self.members.write().await.remove(&session_id).is_some()
    }

    pub async fn rename(&self, who: &Participant) {
        if let Some(name) = self.members.write().await.get_mut(&who.session_id) {
            name.clone_from(&who.display_name);
        }
    }

    pub async fn is_member(&self, session_id: SessionId) -> bool {
        self.members.read().await.contains_key(&session_id)
    }

    /// Encode and send an event. Returns the number of receivers.
    pub fn publish(&self, audience: Audience, message: ServerMessage) -> Result<usize, ProtocolError> {
        let envelope = Envelope::new(audience, message)?;
        log::trace!("Publishing {} to {audience:?}", envelope.message.kind());
        Ok(self.publish_envelope(Arc::new(envelope)))
    }

    pub fn publish_envelope(&self, envelope: Arc<Envelope>) -> usize {
        let count = self.sender.send(envelope).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record events a lagging receiver lost.
    pub fn record_dropped(&self, count: u64) {
        self.atomic_stats
            .messages_dropped
            .fetch_add(count, Ordering::Relaxed);
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn members(&self) -> Vec<Participant> {
        self.members
            .read()
            .await
            .iter()
            .map(|(id, name)| Participant::new(*id, name.clone()))
            .collect()
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_members: self.members.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
