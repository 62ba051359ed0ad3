//! Relay provider: broadcast channel for live updates, blob snapshots for
//! durable catch-up.

use super::blob::BlobStore;
use super::channel::{BroadcastRelay, RelayEvent, RelayMessage, RelayRoom};
use crate::config::RelayConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::EventBus;
use crate::transport::{
    Outbox, PeerInfo, ProviderEvent, SyncProvider, TransportKind, provider_origin,
};
use async_trait::async_trait;
use bandstand_crdt::{Origin, Replica};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

/// Syncs one replica through a [`BroadcastRelay`] room and a [`BlobStore`]
/// snapshot.
///
/// Snapshots are last-writer-wins at the blob level. Two devices uploading
/// concurrently may each overwrite the other's snapshot, but both snapshots
/// are already merged through the live channel, so the loss is temporary.
pub struct RelayProvider {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    room: String,
    replica: Replica,
    origin: Origin,
    local: PeerInfo,
    relay: Arc<dyn BroadcastRelay>,
    blobs: Arc<dyn BlobStore>,
    config: RelayConfig,
    events: EventBus<ProviderEvent>,
    connected: AtomicBool,
    synced: AtomicBool,
    state: Mutex<RelayState>,
}

#[derive(Default)]
struct RelayState {
    channel: Option<Arc<dyn RelayRoom>>,
    outbox: Option<Outbox>,
    reader: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
    peers: HashMap<String, PeerInfo>,
}

impl RelayProvider {
    pub fn new(
        replica: Replica,
        room: impl Into<String>,
        local: PeerInfo,
        relay: Arc<dyn BroadcastRelay>,
        blobs: Arc<dyn BlobStore>,
        config: RelayConfig,
    ) -> Self {
        let room = room.into();
        Self {
            inner: Arc::new(RelayInner {
                origin: provider_origin(TransportKind::Relay, &room),
                room,
                replica,
                local,
                relay,
                blobs,
                config,
                events: EventBus::new(),
                connected: AtomicBool::new(false),
                synced: AtomicBool::new(false),
                state: Mutex::new(RelayState::default()),
            }),
        }
    }

    /// Origin under which this provider applies remote updates.
    pub fn origin(&self) -> &Origin {
        &self.inner.origin
    }

    /// Peers that announced themselves in the room.
    pub fn peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self.inner.lock().peers.values().cloned().collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }

    /// Uploads the full replica state, overwriting the previous snapshot.
    pub async fn save_snapshot(&self) -> SyncResult<()> {
        self.inner.save_snapshot().await
    }

    /// Downloads and applies the snapshot. Returns whether one existed.
    pub async fn load_snapshot(&self) -> SyncResult<bool> {
        self.inner.load_snapshot().await
    }

    /// Saves then reloads the snapshot.
    pub async fn force_sync(&self) -> SyncResult<()> {
        self.inner.save_snapshot().await?;
        self.inner.load_snapshot().await?;
        Ok(())
    }
}

impl RelayInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit_error(&self, error: &SyncError) {
        self.events.publish(&ProviderEvent::error(error));
    }

    fn emit_rejected(&self, error: &SyncError, peer: Option<&str>) {
        self.events.publish(&ProviderEvent::rejected_update(error, peer));
    }

    async fn save_snapshot(&self) -> SyncResult<()> {
        let path = self.config.snapshot_path(&self.room);
        let bytes = self.replica.encode_state_as_update();
        match self.blobs.upload(&path, &bytes, true).await {
            Ok(()) => {
                debug!("Saved snapshot {} ({} bytes)", path, bytes.len());
                Ok(())
            }
            Err(e) => {
                warn!("Failed to save snapshot {}: {}", path, e);
                self.emit_error(&e);
                Err(e)
            }
        }
    }

    async fn load_snapshot(&self) -> SyncResult<bool> {
        let path = self.config.snapshot_path(&self.room);
        let bytes = match self.blobs.download(&path).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!("No snapshot at {}", path);
                return Ok(false);
            }
            Err(e) => {
                warn!("Failed to load snapshot {}: {}", path, e);
                self.emit_error(&e);
                return Err(e);
            }
        };
        if let Err(e) = self.replica.apply_update(&bytes, &self.origin) {
            let e = SyncError::from(e);
            warn!("Discarding unreadable snapshot {}: {}", path, e);
            self.emit_rejected(&e, None);
            return Err(e);
        }
        debug!("Loaded snapshot {} ({} bytes)", path, bytes.len());
        Ok(true)
    }

    async fn send(&self, channel: &Arc<dyn RelayRoom>, event: RelayEvent, payload: Vec<u8>) {
        let message = RelayMessage::new(event, self.local.peer_id.clone(), payload)
            .with_display_name(self.local.display_name.clone());
        if let Err(e) = channel.send(&message).await {
            warn!("Relay send of {:?} to {} failed: {}", event, self.room, e);
            self.emit_error(&e);
        }
    }

    async fn handle_message(&self, channel: &Arc<dyn RelayRoom>, message: RelayMessage) {
        if message.sender == self.local.peer_id {
            return;
        }
        match message.event {
            RelayEvent::Update => {
                if let Err(e) = self.replica.apply_update(&message.payload, &self.origin) {
                    let e = SyncError::from(e);
                    warn!("Rejected update from {} in {}: {}", message.sender, self.room, e);
                    self.emit_rejected(&e, Some(&message.sender));
                }
            }
            RelayEvent::SyncRequest => match self.replica.encode_diff(&message.payload) {
                Ok(diff) => self.send(channel, RelayEvent::Update, diff).await,
                Err(e) => {
                    let e = SyncError::from(e);
                    warn!("Bad sync request from {}: {}", message.sender, e);
                    self.emit_error(&e);
                }
            },
            RelayEvent::Presence => {
                let peer = PeerInfo::new(message.sender, message.display_name);
                let is_new = self
                    .lock()
                    .peers
                    .insert(peer.peer_id.clone(), peer.clone())
                    .is_none();
                if is_new {
                    info!("Peer {} joined {}", peer.label(), self.room);
                    self.events.publish(&ProviderEvent::PeerConnected(peer));
                    // Let the newcomer learn about us, and about its offline edits.
                    self.send(channel, RelayEvent::Presence, Vec::new()).await;
                    self.send(channel, RelayEvent::SyncRequest, self.replica.encode_state_vector())
                        .await;
                }
            }
            RelayEvent::Leave => {
                let removed = self.lock().peers.remove(&message.sender);
                if let Some(peer) = removed {
                    info!("Peer {} left {}", peer.label(), self.room);
                    self.events.publish(&ProviderEvent::PeerDisconnected(peer));
                }
            }
        }
    }

    fn spawn_reader(self: &Arc<Self>, channel: Arc<dyn RelayRoom>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(message) = channel.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.handle_message(&channel, message).await;
            }
            debug!("Relay reader stopped");
        })
    }

    fn spawn_snapshot_timer(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.snapshot_interval();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                // Failures are reported as events and retried next tick.
                let _ = inner.save_snapshot().await;
            }
        })
    }
}

impl Drop for RelayInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(outbox) = state.outbox.take() {
            outbox.abort();
        }
        for handle in [state.reader.take(), state.timer.take()].into_iter().flatten() {
            handle.abort();
        }
    }
}

#[async_trait]
impl SyncProvider for RelayProvider {
    fn kind(&self) -> TransportKind {
        TransportKind::Relay
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
        info!("Connecting relay provider for {}", inner.room);

        // A missing or unreadable snapshot is not fatal; the live channel
        // and catch-up request still bring the replica up to date.
        let _ = inner.load_snapshot().await;

        let channel = match inner.relay.join(&inner.room, &inner.local.peer_id).await {
            Ok(channel) => channel,
            Err(e) => {
                warn!("Failed to join relay room {}: {}", inner.room, e);
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
                        inner.send(&channel, RelayEvent::Update, bytes).await;
                    }
                }
            })?
        };
        let reader = inner.spawn_reader(Arc::clone(&channel));
        let timer = inner.spawn_snapshot_timer();
        {
            let mut state = inner.lock();
            state.channel = Some(Arc::clone(&channel));
            state.outbox = Some(outbox);
            state.reader = Some(reader);
            state.timer = Some(timer);
        }

        inner.connected.store(true, Ordering::SeqCst);
        inner.synced.store(true, Ordering::SeqCst);
        inner.events.publish(&ProviderEvent::Status { connected: true });
        inner.events.publish(&ProviderEvent::Synced);

        inner.send(&channel, RelayEvent::Presence, Vec::new()).await;
        inner
            .send(&channel, RelayEvent::SyncRequest, inner.replica.encode_state_vector())
            .await;
        info!("Relay provider connected to {}", inner.room);
        Ok(())
    }

    async fn disconnect(&self) -> SyncResult<()> {
        let inner = &self.inner;
        if !inner.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let (channel, outbox, reader, timer) = {
            let mut state = inner.lock();
            state.peers.clear();
            (
                state.channel.take(),
                state.outbox.take(),
                state.reader.take(),
                state.timer.take(),
            )
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        if let Some(outbox) = outbox {
            outbox.flush().await;
        }
        if let Some(reader) = reader {
            reader.abort();
        }
        let _ = inner.save_snapshot().await;
        if let Some(channel) = channel {
            inner.send(&channel, RelayEvent::Leave, Vec::new()).await;
            if let Err(e) = channel.leave().await {
                inner.emit_error(&e);
            }
        }
        inner.synced.store(false, Ordering::SeqCst);
        inner.events.publish(&ProviderEvent::Status { connected: false });
        info!("Relay provider disconnected from {}", inner.room);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn is_synced(&self) -> bool {
        self.inner.synced.load(Ordering::SeqCst)
    }

    fn events(&self) -> &EventBus<ProviderEvent> {
        &self.inner.events
    }
}
