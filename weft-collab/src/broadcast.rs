//! Committed-change fan-out.
//!
//! Each document gets one hub. The server publishes every committed change
//! exactly once, anchored to the history length it extends, so every
//! subscriber observes the same gapless total order. A subscriber that
//! falls behind its buffer receives a [`HubEvent::Gap`] instead of silently
//! missing broadcasts; it recovers by fetching the committed history it
//! missed and then keeps reading.

use log::warn;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::change::Change;
use crate::error::CollabError;
use crate::protocol::{MessageType, SyncMessage};
use crate::selection::AuthorId;

/// Display metadata for a connected author.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorInfo {
    pub author_id: AuthorId,
    pub name: String,
}

impl AuthorInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            author_id: Uuid::new_v4(),
            name: name.into(),
        }
    }

    /// Create with an explicit author id (for testing).
    pub fn with_id(author_id: AuthorId, name: impl Into<String>) -> Self {
        Self {
            author_id,
            name: name.into(),
        }
    }
}

/// Point-in-time hub health snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub messages_sent: u64,
    /// Broadcasts overwritten before a lagging subscriber read them.
    pub messages_dropped: u64,
    pub active_authors: usize,
    /// Committed history length covered by broadcasts so far.
    pub published_history: u64,
}

/// What a subscriber pulls off the hub.
#[derive(Debug, Clone)]
pub enum HubEvent {
    Message(Arc<SyncMessage>),
    /// `missed` broadcasts were overwritten while this subscriber lagged.
    /// Recover with a history fetch before reading further.
    Gap { missed: u64 },
}

/// One author's view of the hub's broadcast stream.
pub struct HubSubscription {
    receiver: broadcast::Receiver<Arc<SyncMessage>>,
    dropped: Arc<AtomicU64>,
}

impl HubSubscription {
    /// Next event, or `None` once the hub is gone.
    pub async fn next(&mut self) -> Option<HubEvent> {
        match self.receiver.recv().await {
            Ok(msg) => Some(HubEvent::Message(msg)),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                self.dropped.fetch_add(missed, Ordering::Relaxed);
                warn!("subscriber lagged, {missed} broadcasts lost");
                Some(HubEvent::Gap { missed })
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

/// One document's fan-out hub.
///
/// All authors editing the document share one broadcast channel. The hub
/// enforces publish order: a committed change is accepted only when it
/// starts exactly at the history watermark the previous publish advanced
/// to, so no subscriber can observe a reordered or duplicated commit.
pub struct DocumentHub {
    doc_id: Uuid,
    sender: broadcast::Sender<Arc<SyncMessage>>,
    authors: RwLock<HashMap<AuthorId, AuthorInfo>>,
    capacity: usize,
    /// Watermark advanced by compare-exchange, so concurrent publishers
    /// serialize without a lock.
    published: AtomicU64,
    sent: AtomicU64,
    dropped: Arc<AtomicU64>,
}

impl DocumentHub {
    /// `capacity` is the number of broadcasts buffered per subscriber before
    /// a lagging one starts losing them; `history` is the committed history
    /// length the first publish must start at.
    pub fn new(doc_id: Uuid, capacity: usize, history: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            doc_id,
            sender,
            authors: RwLock::new(HashMap::new()),
            capacity,
            published: AtomicU64::new(history as u64),
            sent: AtomicU64::new(0),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register an author and open their subscription.
    pub async fn join(&self, info: AuthorInfo) -> HubSubscription {
        let receiver = self.sender.subscribe();
        let mut authors = self.authors.write().await;
        authors.insert(info.author_id, info);
        HubSubscription {
            receiver,
            dropped: self.dropped.clone(),
        }
    }

    pub async fn leave(&self, author_id: &AuthorId) -> Option<AuthorInfo> {
        let mut authors = self.authors.write().await;
        authors.remove(author_id)
    }

    /// Broadcast a committed change to every subscriber, the committing
    /// author included; echo filtering is the receiver's job.
    ///
    /// The change must start at the current watermark; anything else is a
    /// stale or out-of-order publish and is refused before any subscriber
    /// sees it. Returns the subscriber count reached.
    pub fn publish_committed(
        &self,
        author_id: AuthorId,
        change: &Change,
    ) -> Result<usize, CollabError> {
        let msg = SyncMessage::new_change(author_id, self.doc_id, change)?;
        self.published
            .compare_exchange(
                change.start as u64,
                change.end() as u64,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|watermark| CollabError::StaleHistory {
                local: watermark as usize,
                remote: change.start,
            })?;
        let reached = self.sender.send(Arc::new(msg)).unwrap_or(0);
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(reached)
    }

    /// Broadcast a presence message (registration, disconnect, heartbeat).
    /// Change-bearing messages must go through [`publish_committed`] so the
    /// watermark stays honest.
    ///
    /// [`publish_committed`]: DocumentHub::publish_committed
    pub fn publish_presence(&self, msg: SyncMessage) -> Result<usize, CollabError> {
        if matches!(
            msg.msg_type,
            MessageType::SubmitChange | MessageType::NewChange
        ) {
            return Err(CollabError::ProtocolViolation(format!(
                "{:?} carries a change and cannot bypass the watermark",
                msg.msg_type
            )));
        }
        let reached = self.sender.send(Arc::new(msg)).unwrap_or(0);
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(reached)
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Committed history length covered by broadcasts so far.
    pub fn published_history(&self) -> usize {
        self.published.load(Ordering::Acquire) as usize
    }

    pub async fn author_count(&self) -> usize {
        self.authors.read().await.len()
    }

    pub async fn authors(&self) -> Vec<AuthorInfo> {
        self.authors.read().await.values().cloned().collect()
    }

    pub async fn has_author(&self, author_id: &AuthorId) -> bool {
        self.authors.read().await.contains_key(author_id)
    }

    pub async fn stats(&self) -> HubStats {
        let authors = self.authors.read().await;
        HubStats {
            messages_sent: self.sent.load(Ordering::Relaxed),
            messages_dropped: self.dropped.load(Ordering::Relaxed),
            active_authors: authors.len(),
            published_history: self.published.load(Ordering::Acquire),
        }
    }
}

/// Maps document ids to their hubs so traffic never crosses documents.
pub struct HubRegistry {
    hubs: RwLock<HashMap<Uuid, Arc<DocumentHub>>>,
    capacity: usize,
}

impl HubRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            hubs: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Hub for `doc_id`, created at the `history` watermark if absent. An
    /// existing hub keeps the watermark it has already advanced to.
    pub async fn open(&self, doc_id: Uuid, history: usize) -> Arc<DocumentHub> {
        if let Some(hub) = self.hubs.read().await.get(&doc_id) {
            return hub.clone();
        }
        self.hubs
            .write()
            .await
            .entry(doc_id)
            .or_insert_with(|| Arc::new(DocumentHub::new(doc_id, self.capacity, history)))
            .clone()
    }

    /// Drop the hub once its last author has left. Returns whether it was
    /// removed.
    pub async fn close_idle(&self, doc_id: &Uuid) -> bool {
        let mut hubs = self.hubs.write().await;
        match hubs.get(doc_id) {
            Some(hub) if hub.author_count().await == 0 => {
                hubs.remove(doc_id);
                true
            }
            _ => false,
        }
    }

    pub async fn hub_count(&self) -> usize {
        self.hubs.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<Uuid> {
        self.hubs.read().await.keys().cloned().collect()
    }
}
