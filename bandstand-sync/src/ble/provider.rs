//! Bluetooth LE provider: chunked writes over MTU-limited links.

use super::framing::{self, Packet};
use super::radio::{BleAdvertisement, BleLink, BleRadio, BleScan};
use super::reassembly::Reassembler;
use crate::config::BleConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::EventBus;
use crate::transport::{PeerInfo, ProviderEvent, Role, SyncProvider, TransportKind, provider_origin};
use async_trait::async_trait;
use bandstand_crdt::{Origin, Replica, UpdateSubscription};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Syncs one replica with nearby devices.
///
/// The host advertises and accepts any number of links; a joiner scans and
/// connects to the first matching host. Updates received from one peer are
/// forwarded to every other peer, so the host relays between joiners.
///
/// Links are keyed by radio device id. A peer's first packet announces it
/// with [`ProviderEvent::PeerConnected`], carrying the identity from its
/// hello when it sent one.
pub struct BleProvider {
    inner: Arc<BleInner>,
}

struct BleInner {
    room: String,
    local_name: String,
    role: Role,
    local: Option<PeerInfo>,
    replica: Replica,
    origin: Origin,
    radio: Arc<dyn BleRadio>,
    config: BleConfig,
    events: EventBus<ProviderEvent>,
    active: AtomicBool,
    connected: AtomicBool,
    synced: AtomicBool,
    unavailable_reported: AtomicBool,
    next_generation: AtomicU64,
    state: Mutex<BleState>,
}

struct BleState {
    peers: HashMap<String, BlePeer>,
    reassembler: Reassembler,
    subscription: Option<UpdateSubscription>,
    discovery: Option<JoinHandle<()>>,
}

struct BlePeer {
    info: PeerInfo,
    announced: bool,
    generation: u64,
    mtu: usize,
    link: Arc<dyn BleLink>,
    /// Each item is every packet of one message, written back to back.
    outgoing: mpsc::UnboundedSender<Vec<Vec<u8>>>,
    writer: JoinHandle<()>,
    /// Started once the peer is registered.
    reader: Option<JoinHandle<()>>,
}

impl BlePeer {
    fn shutdown(self) {
        self.writer.abort();
        if let Some(reader) = self.reader {
            reader.abort();
        }
        let link = self.link;
        tokio::spawn(async move { link.close().await });
    }
}

/// Short tag identifying `room` in an advertised name.
pub fn room_tag(room: &str) -> String {
    let digest = Sha256::digest(room.as_bytes());
    hex::encode(&digest[..4])
}

impl BleProvider {
    /// The advertisement name is `<prefix><room tag>`; the host advertises
    /// it and a joiner scans for it.
    pub fn new(
        replica: Replica,
        room: impl Into<String>,
        role: Role,
        radio: Arc<dyn BleRadio>,
        config: BleConfig,
    ) -> Self {
        let room = room.into();
        let local_name = format!("{}{}", config.name_prefix, room_tag(&room));
        Self {
            inner: Arc::new(BleInner {
                origin: provider_origin(TransportKind::Ble, &room),
                state: Mutex::new(BleState {
                    peers: HashMap::new(),
                    reassembler: Reassembler::new(config.max_message_size),
                    subscription: None,
                    discovery: None,
                }),
                room,
                local_name,
                role,
                local: None,
                replica,
                radio,
                config,
                events: EventBus::new(),
                active: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                synced: AtomicBool::new(false),
                unavailable_reported: AtomicBool::new(false),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Announces `local` to every linked peer.
    ///
    /// Must be called before [`connect`](SyncProvider::connect).
    pub fn with_local(mut self, local: PeerInfo) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.local = Some(local),
            None => warn!("Bluetooth provider for {} already shared", self.inner.room),
        }
        self
    }

    pub fn origin(&self) -> &Origin {
        &self.inner.origin
    }

    pub fn local_name(&self) -> &str {
        &self.inner.local_name
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Currently linked peers.
    pub fn peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self
            .inner
            .lock()
            .peers
            .values()
            .map(|p| p.info.clone())
            .collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }

    /// Bytes of partial messages buffered for `peer`, if any.
    pub fn pending_bytes(&self, peer: &str) -> Option<usize> {
        self.inner.lock().reassembler.pending(peer)
    }
}

impl BleInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, BleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit_error(&self, error: &SyncError) {
        self.events.publish(&ProviderEvent::error(error));
    }

    fn spawn_advertiser(
        self: &Arc<Self>,
        mut advertisement: Box<dyn BleAdvertisement>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(link) = advertisement.next_link().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.add_peer(link);
            }
            debug!("Advertisement ended");
        })
    }

    fn spawn_scanner(self: &Arc<Self>, mut scan: Box<dyn BleScan>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let Some(device) = scan.next_device().await else {
                return;
            };
            drop(scan);
            let Some(inner) = weak.upgrade() else { return };
            debug!("Found host {} ({})", device.local_name, device.id);
            match inner.radio.connect(&device).await {
                Ok(link) => inner.add_peer(link),
                Err(e) => {
                    warn!("Failed to connect to {}: {}", device.id, e);
                    inner.emit_error(&e);
                }
            }
        })
    }

    fn spawn_writer(
        self: &Arc<Self>,
        peer_id: String,
        generation: u64,
        link: Arc<dyn BleLink>,
        mut rx: mpsc::UnboundedReceiver<Vec<Vec<u8>>>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(packets) = rx.recv().await {
                for packet in &packets {
                    if let Err(e) = link.write(packet).await {
                        warn!("Write to {} failed: {}", peer_id, e);
                        if let Some(inner) = weak.upgrade() {
                            inner.remove_peer(&peer_id, generation, Some(&e));
                        }
                        return;
                    }
                }
            }
        })
    }

    fn spawn_reader(
        self: &Arc<Self>,
        peer_id: String,
        generation: u64,
        link: Arc<dyn BleLink>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(packet) = link.next_notification().await {
                let Some(inner) = weak.upgrade() else { return };
                inner.handle_packet(&peer_id, &packet);
            }
            if let Some(inner) = weak.upgrade() {
                inner.remove_peer(&peer_id, generation, None);
            }
        })
    }

    fn observe(self: &Arc<Self>) -> SyncResult<UpdateSubscription> {
        let weak = Arc::downgrade(self);
        let origin = self.origin.clone();
        Ok(self.replica.on_update(move |update| {
            if update.is_from(&origin) {
                return;
            }
            if let Some(inner) = weak.upgrade() {
                inner.broadcast(update.bytes, None);
            }
        })?)
    }

    fn add_peer(self: &Arc<Self>, link: Arc<dyn BleLink>) {
        let peer_id = link.peer_id().to_string();
        let mtu = link.mtu();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (outgoing, rx) = mpsc::unbounded_channel();

        // The entry exists before any task can remove it.
        let (first, replaced) = {
            let mut state = self.lock();
            let peer = BlePeer {
                info: PeerInfo::new(peer_id.clone(), None),
                announced: false,
                generation,
                mtu,
                writer: self.spawn_writer(peer_id.clone(), generation, Arc::clone(&link), rx),
                reader: None,
                link: Arc::clone(&link),
                outgoing,
            };
            let first = state.peers.is_empty();
            let replaced = state.peers.insert(peer_id.clone(), peer);
            if replaced.is_some() {
                state.reassembler.purge(&peer_id);
            }
            (first, replaced)
        };
        if let Some(old) = replaced {
            debug!("Replaced stale link to {}", peer_id);
            old.shutdown();
        }
        if first {
            match self.observe() {
                Ok(subscription) => self.lock().subscription = Some(subscription),
                Err(e) => self.emit_error(&e),
            }
            self.connected.store(true, Ordering::SeqCst);
            self.events.publish(&ProviderEvent::Status { connected: true });
        }
        info!("Peer {} linked on {} (mtu {})", peer_id, self.room, mtu);

        // Reading starts after `Status` so a dead link reports in order.
        let reader = self.spawn_reader(peer_id.clone(), generation, link);
        {
            let mut state = self.lock();
            match state.peers.get_mut(&peer_id) {
                Some(peer) if peer.generation == generation => peer.reader = Some(reader),
                _ => reader.abort(),
            }
        }

        let mut packets = Vec::with_capacity(2);
        if let Some(local) = &self.local {
            match framing::hello(local, mtu) {
                Ok(Some(packet)) => packets.push(packet),
                Ok(None) => debug!("Peer id {} does not fit mtu {}", local.peer_id, mtu),
                Err(e) => self.emit_error(&e),
            }
        }
        match framing::sync_request(&self.replica.encode_state_vector(), mtu) {
            Ok(packet) => packets.push(packet),
            Err(e) => self.emit_error(&e),
        }
        self.queue(&peer_id, packets);
    }

    /// Publishes `PeerConnected` on a peer's first packet, taking the
    /// identity from `hello` when the peer opened with one.
    fn announce(&self, peer_id: &str, hello: Option<PeerInfo>) {
        let info = {
            let mut state = self.lock();
            let Some(peer) = state.peers.get_mut(peer_id) else {
                return;
            };
            if peer.announced {
                if hello.is_some() {
                    debug!("Ignoring repeated hello from {}", peer_id);
                }
                return;
            }
            peer.announced = true;
            if let Some(info) = hello {
                peer.info = info;
            }
            peer.info.clone()
        };
        info!("Peer {} is {} on {}", peer_id, info.label(), self.room);
        self.events.publish(&ProviderEvent::PeerConnected(info));
    }

    fn remove_peer(&self, peer_id: &str, generation: u64, error: Option<&SyncError>) {
        let (peer, now_empty, subscription) = {
            let mut state = self.lock();
            if state.peers.get(peer_id).map(|p| p.generation) != Some(generation) {
                return;
            }
            let Some(peer) = state.peers.remove(peer_id) else {
                return;
            };
            state.reassembler.purge(peer_id);
            let now_empty = state.peers.is_empty();
            let subscription = if now_empty {
                state.subscription.take()
            } else {
                None
            };
            (peer, now_empty, subscription)
        };
        drop(subscription);
        let info = peer.info.clone();
        peer.shutdown();

        if let Some(e) = error {
            self.emit_error(e);
        }
        info!("Peer {} lost on {}", peer_id, self.room);
        self.events.publish(&ProviderEvent::PeerDisconnected(info));
        if now_empty {
            self.connected.store(false, Ordering::SeqCst);
            self.synced.store(false, Ordering::SeqCst);
            self.events.publish(&ProviderEvent::Status { connected: false });
        }
    }

    fn queue(&self, peer_id: &str, packets: Vec<Vec<u8>>) {
        let state = self.lock();
        if let Some(peer) = state.peers.get(peer_id) {
            if peer.outgoing.send(packets).is_err() {
                debug!("Writer for {} already stopped", peer_id);
            }
        }
    }

    fn send_to(&self, peer_id: &str, message: &[u8]) {
        let mtu = match self.lock().peers.get(peer_id) {
            Some(peer) => peer.mtu,
            None => return,
        };
        match framing::fragment(message, mtu) {
            Ok(packets) => self.queue(peer_id, packets),
            Err(e) => self.emit_error(&e),
        }
    }

    /// Sends `message` to every peer except `except`.
    fn broadcast(&self, message: &[u8], except: Option<&str>) {
        let mut failures = Vec::new();
        {
            let state = self.lock();
            for (peer_id, peer) in &state.peers {
                if Some(peer_id.as_str()) == except {
                    continue;
                }
                match framing::fragment(message, peer.mtu) {
                    Ok(packets) => {
                        let _ = peer.outgoing.send(packets);
                    }
                    Err(e) => failures.push(e),
                }
            }
        }
        for e in &failures {
            self.emit_error(e);
        }
    }

    fn handle_packet(&self, peer_id: &str, raw: &[u8]) {
        let packet = match framing::parse(raw) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Malformed packet from {}: {}", peer_id, e);
                self.emit_error(&e);
                return;
            }
        };
        if let Packet::Control {
            code: framing::HELLO,
            body,
        } = packet
        {
            match framing::parse_hello(body) {
                Ok(info) => self.announce(peer_id, Some(info)),
                Err(e) => {
                    warn!("Bad hello from {}: {}", peer_id, e);
                    self.emit_error(&e);
                    self.announce(peer_id, None);
                }
            }
            return;
        }
        self.announce(peer_id, None);

        match packet {
            Packet::Control {
                code: framing::SYNC_REQUEST,
                body,
            } => match self.replica.encode_diff(body) {
                Ok(diff) => self.send_to(peer_id, &diff),
                Err(e) => self.emit_error(&SyncError::from(e)),
            },
            Packet::Control { code, .. } => {
                debug!("Ignoring control code {:#04x} from {}", code, peer_id);
            }
            Packet::Whole(message) => self.apply(peer_id, message),
            Packet::Fragment { last, chunk } => {
                let assembled = self.lock().reassembler.push(peer_id, last, chunk);
                match assembled {
                    Ok(Some(message)) => self.apply(peer_id, &message),
                    Ok(None) => {}
                    Err(e) => {
                        warn!("Dropping oversized message from {}: {}", peer_id, e);
                        self.emit_error(&e);
                    }
                }
            }
        }
    }

    fn apply(&self, peer_id: &str, message: &[u8]) {
        if let Err(e) = self.replica.apply_update(message, &self.origin) {
            let e = SyncError::from(e);
            warn!("Rejected update from {} on {}: {}", peer_id, self.room, e);
            let sender = self
                .lock()
                .peers
                .get(peer_id)
                .map_or_else(|| peer_id.to_string(), |p| p.info.peer_id.clone());
            self.events.publish(&ProviderEvent::rejected_update(&e, Some(&sender)));
            return;
        }
        self.broadcast(message, Some(peer_id));
        if !self.synced.swap(true, Ordering::SeqCst) {
            self.events.publish(&ProviderEvent::Synced);
        }
    }
}

impl Drop for BleInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(discovery) = state.discovery.take() {
            discovery.abort();
        }
        for (_, peer) in state.peers.drain() {
            peer.writer.abort();
            if let Some(reader) = peer.reader {
                reader.abort();
            }
        }
    }
}

#[async_trait]
impl SyncProvider for BleProvider {
    fn kind(&self) -> TransportKind {
        TransportKind::Ble
    }

    fn room(&self) -> &str {
        &self.inner.room
    }

    fn replica(&self) -> &Replica {
        &self.inner.replica
    }

    async fn connect(&self) -> SyncResult<()> {
        let inner = &self.inner;
        if inner.active.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !inner.radio.is_available().await {
            inner.active.store(false, Ordering::SeqCst);
            let e = SyncError::TransportUnavailable(format!(
                "bluetooth unavailable for {}",
                inner.room
            ));
            if !inner.unavailable_reported.swap(true, Ordering::SeqCst) {
                warn!("{}", e);
                inner.emit_error(&e);
            }
            return Err(e);
        }

        let service = inner.config.service_uuid;
        let discovery = match inner.role {
            Role::Host => inner
                .radio
                .advertise(service, &inner.local_name)
                .await
                .map(|advertisement| inner.spawn_advertiser(advertisement)),
            Role::Joiner => inner
                .radio
                .scan(service, &inner.local_name)
                .await
                .map(|scan| inner.spawn_scanner(scan)),
        };
        let discovery = match discovery {
            Ok(handle) => handle,
            Err(e) => {
                inner.active.store(false, Ordering::SeqCst);
                warn!("Bluetooth discovery failed for {}: {}", inner.room, e);
                inner.emit_error(&e);
                return Err(e);
            }
        };
        inner.lock().discovery = Some(discovery);
        info!(
            "Bluetooth provider {} as {:?} on {}",
            inner.local_name, inner.role, inner.room
        );
        Ok(())
    }

    async fn disconnect(&self) -> SyncResult<()> {
        let inner = &self.inner;
        if !inner.active.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let (peers, subscription, discovery) = {
            let mut state = inner.lock();
            state.reassembler.clear();
            let peers: Vec<BlePeer> = state.peers.drain().map(|(_, peer)| peer).collect();
            (peers, state.subscription.take(), state.discovery.take())
        };
        if let Some(discovery) = discovery {
            discovery.abort();
            // The task owns the advertisement or scan; wait until it is dropped.
            let _ = discovery.await;
        }
        drop(subscription);

        for peer in peers {
            let BlePeer {
                info,
                link,
                outgoing,
                mut writer,
                reader,
                ..
            } = peer;
            // Closing the queue lets the writer finish what is already queued.
            drop(outgoing);
            if tokio::time::timeout(inner.config.flush_timeout(), &mut writer)
                .await
                .is_err()
            {
                debug!("Gave up flushing writes to {}", info.peer_id);
                writer.abort();
            }
            if let Some(reader) = reader {
                reader.abort();
            }
            link.close().await;
            inner.events.publish(&ProviderEvent::PeerDisconnected(info));
        }

        inner.synced.store(false, Ordering::SeqCst);
        if inner.connected.swap(false, Ordering::SeqCst) {
            inner.events.publish(&ProviderEvent::Status { connected: false });
        }
        info!("Bluetooth provider disconnected from {}", inner.room);
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
