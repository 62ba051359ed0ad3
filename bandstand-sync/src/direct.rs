//! Direct peer provider over an external peer mesh.
//!
//! Wire messages carry one tag byte: `0x00` followed by an update, or
//! `0x01` followed by the sender's state vector (a catch-up request).

use crate::error::{SyncError, SyncResult};
use crate::events::EventBus;
use crate::transport::{
    Outbox, PeerInfo, ProviderEvent, SyncProvider, TransportKind, provider_origin,
};
use async_trait::async_trait;
use bandstand_crdt::{Origin, Replica};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const TAG_UPDATE: u8 = 0x00;
const TAG_SYNC_REQUEST: u8 = 0x01;

/// Events delivered by a mesh room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    PeerJoined(PeerInfo),
    PeerLeft(PeerInfo),
    Data { from: String, bytes: Vec<u8> },
}

/// A peer-to-peer mesh with named rooms.
#[async_trait]
pub trait PeerMesh: Send + Sync {
    async fn open(&self, room: &str, local: &PeerInfo) -> SyncResult<Arc<dyn MeshRoom>>;
}

/// Membership in one mesh room. `send` reaches every other member.
#[async_trait]
pub trait MeshRoom: Send + Sync {
    async fn send(&self, bytes: &[u8]) -> SyncResult<()>;

    /// Next event, or `None` once closed.
    async fn next_event(&self) -> Option<MeshEvent>;

    async fn close(&self);
}

// ── In-memory mesh ──────────────────────────────────────────────

type Members = HashMap<String, (PeerInfo, mpsc::UnboundedSender<MeshEvent>)>;

/// In-process mesh. Clones share rooms.
#[derive(Clone, Default)]
pub struct MemoryMesh {
    rooms: Arc<RwLock<HashMap<String, Members>>>,
}

impl MemoryMesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Members of `room`, sorted by id.
    pub async fn members(&self, room: &str) -> Vec<String> {
        let rooms = self.rooms.read().await;
        let mut ids: Vec<String> = rooms
            .get(room)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }
}

#[async_trait]
impl PeerMesh for MemoryMesh {
    async fn open(&self, room: &str, local: &PeerInfo) -> SyncResult<Arc<dyn MeshRoom>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut rooms = self.rooms.write().await;
        let members = rooms.entry(room.to_string()).or_default();
        if members.contains_key(&local.peer_id) {
            return Err(SyncError::ConnectionFailed(format!(
                "{} already in mesh room {room}",
                local.peer_id
            )));
        }
        for (info, other) in members.values() {
            let _ = other.send(MeshEvent::PeerJoined(local.clone()));
            let _ = tx.send(MeshEvent::PeerJoined(info.clone()));
        }
        members.insert(local.peer_id.clone(), (local.clone(), tx));
        Ok(Arc::new(MemoryMeshRoom {
            mesh: self.clone(),
            room: room.to_string(),
            local: local.clone(),
            rx: AsyncMutex::new(rx),
        }))
    }
}

struct MemoryMeshRoom {
    mesh: MemoryMesh,
    room: String,
    local: PeerInfo,
    rx: AsyncMutex<mpsc::UnboundedReceiver<MeshEvent>>,
}

#[async_trait]
impl MeshRoom for MemoryMeshRoom {
    async fn send(&self, bytes: &[u8]) -> SyncResult<()> {
        let rooms = self.mesh.rooms.read().await;
        let members = rooms
            .get(&self.room)
            .filter(|m| m.contains_key(&self.local.peer_id))
            .ok_or(SyncError::ChannelClosed)?;
        for (id, (_, tx)) in members {
            if id == &self.local.peer_id {
                continue;
            }
            let _ = tx.send(MeshEvent::Data {
                from: self.local.peer_id.clone(),
                bytes: bytes.to_vec(),
            });
        }
        Ok(())
    }

    async fn next_event(&self) -> Option<MeshEvent> {
        self.rx.lock().await.recv().await
    }

    async fn close(&self) {
        let mut rooms = self.mesh.rooms.write().await;
        let Some(members) = rooms.get_mut(&self.room) else {
            return;
        };
        // Dropping our sender ends our own event stream.
        if members.remove(&self.local.peer_id).is_none() {
            return;
        }
        for (_, tx) in members.values() {
            let _ = tx.send(MeshEvent::PeerLeft(self.local.clone()));
        }
        if members.is_empty() {
            rooms.remove(&self.room);
        }
    }
}

// ── Provider ────────────────────────────────────────────────────

/// Syncs one replica through a [`PeerMesh`] room.
pub struct DirectProvider {
    inner: Arc<DirectInner>,
}

struct DirectInner {
    room: String,
    replica: Replica,
    origin: Origin,
    local: PeerInfo,
    mesh: Arc<dyn PeerMesh>,
    events: EventBus<ProviderEvent>,
    connected: AtomicBool,
    state: Mutex<DirectState>,
}

#[derive(Default)]
struct DirectState {
    channel: Option<Arc<dyn MeshRoom>>,
    outbox: Option<Outbox>,
    reader: Option<JoinHandle<()>>,
    peers: HashMap<String, PeerInfo>,
}

fn tagged(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(body.len() + 1);
    message.push(tag);
    message.extend_from_slice(body);
    message
}

impl DirectProvider {
    pub fn new(
        replica: Replica,
        room: impl Into<String>,
        local: PeerInfo,
        mesh: Arc<dyn PeerMesh>,
    ) -> Self {
        let room = room.into();
        Self {
            inner: Arc::new(DirectInner {
                origin: provider_origin(TransportKind::Direct, &room),
                room,
                replica,
                local,
                mesh,
                events: EventBus::new(),
                connected: AtomicBool::new(false),
                state: Mutex::new(DirectState::default()),
            }),
        }
    }

    pub fn origin(&self) -> &Origin {
        &self.inner.origin
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self.inner.lock().peers.values().cloned().collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }
}

impl DirectInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, DirectState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit_error(&self, error: &SyncError) {
        self.events.publish(&ProviderEvent::error(error));
    }

    fn emit_rejected(&self, error: &SyncError, peer: &str) {
        self.events.publish(&ProviderEvent::rejected_update(error, Some(peer)));
    }

    async fn send(&self, channel: &Arc<dyn MeshRoom>, message: Vec<u8>) {
        if let Err(e) = channel.send(&message).await {
            warn!("Mesh send on {} failed: {}", self.room, e);
            self.emit_error(&e);
        }
    }

    async fn handle_event(&self, channel: &Arc<dyn MeshRoom>, event: MeshEvent) {
        match event {
            MeshEvent::PeerJoined(peer) => {
                self.lock().peers.insert(peer.peer_id.clone(), peer.clone());
                info!("Peer {} joined {}", peer.label(), self.room);
                self.events.publish(&ProviderEvent::PeerConnected(peer));
                let request = tagged(TAG_SYNC_REQUEST, &self.replica.encode_state_vector());
                self.send(channel, request).await;
            }
            MeshEvent::PeerLeft(peer) => {
                if self.lock().peers.remove(&peer.peer_id).is_some() {
                    info!("Peer {} left {}", peer.label(), self.room);
                    self.events.publish(&ProviderEvent::PeerDisconnected(peer));
                }
            }
            MeshEvent::Data { from, bytes } => {
                let Some((&tag, body)) = bytes.split_first() else {
                    self.emit_error(&SyncError::Protocol(format!("empty message from {from}")));
                    return;
                };
                match tag {
                    TAG_UPDATE => {
                        if let Err(e) = self.replica.apply_update(body, &self.origin) {
                            let e = SyncError::from(e);
                            warn!("Rejected update from {} on {}: {}", from, self.room, e);
                            self.emit_rejected(&e, &from);
                        }
                    }
                    TAG_SYNC_REQUEST => match self.replica.encode_diff(body) {
                        Ok(diff) => self.send(channel, tagged(TAG_UPDATE, &diff)).await,
                        Err(e) => self.emit_error(&SyncError::from(e)),
                    },
                    other => {
                        self.emit_error(&SyncError::Protocol(format!(
                            "unknown message tag {other:#04x} from {from}"
                        )));
                    }
                }
            }
        }
    }
}

impl Drop for DirectInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(outbox) = state.outbox.take() {
            outbox.abort();
        }
        if let Some(reader) = state.reader.take() {
            reader.abort();
        }
    }
}

#[async_trait]
impl SyncProvider for DirectProvider {
    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }

    fn room(&self) -> &str {
        &self.inner.room
    }

    fn replica(&self) -> &Replica {
        &self.inner.replica
    }

    async fn connect(&self) -> SyncResult<()> {
        let inner = &self.inner;
        if inner.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        let channel = match inner.mesh.open(&inner.room, &inner.local).await {
            Ok(channel) => channel,
            Err(e) => {
                warn!("Failed to open mesh room {}: {}", inner.room, e);
                inner.emit_error(&e);
                return Err(e);
            }
        };

        let outbox = {
            let channel = Arc::clone(&channel);
            let weak = Arc::downgrade(inner);
            Outbox::start(&inner.replica, inner.origin.clone(), move |bytes| {
                let channel = Arc::clone(&channel);
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.send(&channel, tagged(TAG_UPDATE, &bytes)).await;
                    }
                }
            })?
        };
        let reader = {
            let channel = Arc::clone(&channel);
            let weak = Arc::downgrade(inner);
            tokio::spawn(async move {
                while let Some(event) = channel.next_event().await {
                    let Some(inner) = weak.upgrade() else { break };
                    inner.handle_event(&channel, event).await;
                }
                debug!("Mesh reader stopped");
            })
        };
        {
            let mut state = inner.lock();
            state.channel = Some(Arc::clone(&channel));
            state.outbox = Some(outbox);
            state.reader = Some(reader);
        }
        inner.connected.store(true, Ordering::SeqCst);
        inner.events.publish(&ProviderEvent::Status { connected: true });
        inner.events.publish(&ProviderEvent::Synced);

        let request = tagged(TAG_SYNC_REQUEST, &inner.replica.encode_state_vector());
        inner.send(&channel, request).await;
        info!("Direct provider connected to {}", inner.room);
        Ok(())
    }

    async fn disconnect(&self) -> SyncResult<()> {
        let inner = &self.inner;
        if !inner.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let (channel, outbox, reader) = {
            let mut state = inner.lock();
            state.peers.clear();
            (state.channel.take(), state.outbox.take(), state.reader.take())
        };
        if let Some(outbox) = outbox {
            outbox.flush().await;
        }
        if let Some(reader) = reader {
            reader.abort();
        }
        if let Some(channel) = channel {
            channel.close().await;
        }
        inner.events.publish(&ProviderEvent::Status { connected: false });
        info!("Direct provider disconnected from {}", inner.room);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn is_synced(&self) -> bool {
        self.is_connected()
    }

    fn events(&self) -> &EventBus<ProviderEvent> {
        &self.inner.events
    }
}
