//! Broadcast channel capability and its in-memory implementation.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tracing::{debug, warn};

/// Event names carried on the relay channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelayEvent {
    /// Payload is an encoded update.
    Update,
    /// Payload is the sender's state vector; members answer with a diff.
    SyncRequest,
    /// Sender is in the room.
    Presence,
    /// Sender left the room.
    Leave,
}

/// One message on the relay channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayMessage {
    pub event: RelayEvent,
    pub sender: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default, with = "base64_bytes")]
    pub payload: Vec<u8>,
    pub sent_at: DateTime<Utc>,
}

impl RelayMessage {
    pub fn new(event: RelayEvent, sender: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            event,
            sender: sender.into(),
            display_name: None,
            payload,
            sent_at: Utc::now(),
        }
    }

    pub fn with_display_name(mut self, name: Option<String>) -> Self {
        self.display_name = name;
        self
    }

    pub fn to_json(&self) -> SyncResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> SyncResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        STANDARD.decode(raw).map_err(serde::de::Error::custom)
    }
}

/// A broadcast service with named rooms.
#[async_trait]
pub trait BroadcastRelay: Send + Sync {
    /// Joins `room` as `member`. Returning `Ok` is the join confirmation.
    async fn join(&self, room: &str, member: &str) -> SyncResult<Arc<dyn RelayRoom>>;
}

/// Membership in one relay room.
///
/// Every member receives every message sent to the room, including its own;
/// filtering by sender is the caller's job.
#[async_trait]
pub trait RelayRoom: Send + Sync {
    async fn send(&self, message: &RelayMessage) -> SyncResult<()>;

    /// Next message, or `None` once the membership is closed.
    async fn recv(&self) -> Option<RelayMessage>;

    async fn leave(&self) -> SyncResult<()>;
}

/// Counters for one in-memory room.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub members: usize,
}

struct RoomGroup {
    sender: broadcast::Sender<Arc<RelayMessage>>,
    members: AtomicUsize,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl RoomGroup {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            members: AtomicUsize::new(0),
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// In-process relay hub: rooms map to tokio broadcast channels.
///
/// Clones share the same rooms, so several providers (one per simulated
/// device) can meet in one process. `set_offline(true)` makes joins and
/// sends fail, for exercising error paths.
#[derive(Clone)]
pub struct MemoryRelay {
    rooms: Arc<RwLock<HashMap<String, Arc<RoomGroup>>>>,
    capacity: usize,
    offline: Arc<AtomicBool>,
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new(256)
    }
}

impl MemoryRelay {
    /// Creates a hub buffering up to `capacity` messages per member.
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            offline: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    async fn group(&self, room: &str) -> Arc<RoomGroup> {
        {
            let rooms = self.rooms.read().await;
            if let Some(group) = rooms.get(room) {
                return Arc::clone(group);
            }
        }
        let mut rooms = self.rooms.write().await;
        Arc::clone(
            rooms
                .entry(room.to_string())
                .or_insert_with(|| Arc::new(RoomGroup::new(self.capacity))),
        )
    }

    /// Counters for `room`, if it exists.
    pub async fn stats(&self, room: &str) -> Option<RelayStats> {
        let rooms = self.rooms.read().await;
        rooms.get(room).map(|group| RelayStats {
            messages_sent: group.messages_sent.load(Ordering::Relaxed),
            messages_dropped: group.messages_dropped.load(Ordering::Relaxed),
            members: group.members.load(Ordering::Relaxed),
        })
    }

    /// Names of rooms that currently have members.
    pub async fn active_rooms(&self) -> Vec<String> {
        let rooms = self.rooms.read().await;
        let mut names: Vec<String> = rooms
            .iter()
            .filter(|(_, g)| g.members.load(Ordering::Relaxed) > 0)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

#[async_trait]
impl BroadcastRelay for MemoryRelay {
    async fn join(&self, room: &str, member: &str) -> SyncResult<Arc<dyn RelayRoom>> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SyncError::ConnectionFailed(format!(
                "relay offline, cannot join {room}"
            )));
        }
        let group = self.group(room).await;
        let receiver = group.sender.subscribe();
        group.members.fetch_add(1, Ordering::Relaxed);
        debug!("{} joined relay room {}", member, room);
        let (closed, _) = watch::channel(false);
        Ok(Arc::new(MemoryRoom {
            room: room.to_string(),
            group,
            receiver: Mutex::new(receiver),
            closed,
            offline: Arc::clone(&self.offline),
        }))
    }
}

struct MemoryRoom {
    room: String,
    group: Arc<RoomGroup>,
    receiver: Mutex<broadcast::Receiver<Arc<RelayMessage>>>,
    closed: watch::Sender<bool>,
    offline: Arc<AtomicBool>,
}

#[async_trait]
impl RelayRoom for MemoryRoom {
    async fn send(&self, message: &RelayMessage) -> SyncResult<()> {
        if *self.closed.borrow() {
            return Err(SyncError::ChannelClosed);
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(SyncError::Network(format!("relay offline, dropped {:?}", message.event)));
        }
        // No receivers is not an error: the room may simply be empty.
        let _ = self.group.sender.send(Arc::new(message.clone()));
        self.group.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn recv(&self) -> Option<RelayMessage> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return None;
        }
        let mut receiver = self.receiver.lock().await;
        loop {
            tokio::select! {
                result = receiver.recv() => match result {
                    Ok(message) => return Some((*message).clone()),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        self.group
                            .messages_dropped
                            .fetch_add(skipped, Ordering::Relaxed);
                        warn!("Relay member lagged in {}, skipped {} messages", self.room, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
                _ = closed.wait_for(|c| *c) => return None,
            }
        }
    }

    async fn leave(&self) -> SyncResult<()> {
        if !self.closed.send_replace(true) {
            self.group.members.fetch_sub(1, Ordering::Relaxed);
        }
        Ok(())
    }
}
