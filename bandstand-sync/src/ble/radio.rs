//! Short-range radio capability and an in-memory air for tests.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tracing::debug;
use uuid::Uuid;

/// A device seen while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BleDevice {
    pub id: String,
    pub local_name: String,
}

/// The local radio.
#[async_trait]
pub trait BleRadio: Send + Sync {
    /// Whether the radio is present, powered and permitted.
    async fn is_available(&self) -> bool;

    /// Starts advertising `service` under `local_name`.
    async fn advertise(
        &self,
        service: Uuid,
        local_name: &str,
    ) -> SyncResult<Box<dyn BleAdvertisement>>;

    /// Scans for devices advertising `service` with a name starting with `name_prefix`.
    async fn scan(&self, service: Uuid, name_prefix: &str) -> SyncResult<Box<dyn BleScan>>;

    /// Opens a link to a discovered device.
    async fn connect(&self, device: &BleDevice) -> SyncResult<Arc<dyn BleLink>>;
}

/// A running advertisement. Dropping it stops advertising.
#[async_trait]
pub trait BleAdvertisement: Send {
    /// Next central that connected, or `None` once stopped.
    async fn next_link(&mut self) -> Option<Arc<dyn BleLink>>;
}

/// A running scan. Dropping it stops scanning.
#[async_trait]
pub trait BleScan: Send {
    /// Next matching device, or `None` once stopped.
    async fn next_device(&mut self) -> Option<BleDevice>;
}

/// One connection: a write characteristic out, notifications in.
#[async_trait]
pub trait BleLink: Send + Sync {
    /// Stable identifier of the remote device.
    fn peer_id(&self) -> &str;

    /// Largest packet a single write may carry.
    fn mtu(&self) -> usize;

    async fn write(&self, packet: &[u8]) -> SyncResult<()>;

    /// Next notification, or `None` once the link is closed.
    async fn next_notification(&self) -> Option<Vec<u8>>;

    async fn close(&self);
}

// ── In-memory air ───────────────────────────────────────────────

struct Advertiser {
    service: Uuid,
    local_name: String,
    mtu: usize,
    incoming: mpsc::UnboundedSender<Arc<dyn BleLink>>,
}

struct Scanner {
    service: Uuid,
    name_prefix: String,
    found: mpsc::UnboundedSender<BleDevice>,
}

#[derive(Default)]
struct AirState {
    /// Keyed by device and local name; one device may advertise several rooms.
    advertisers: HashMap<(String, String), Advertiser>,
    scanners: HashMap<u64, Scanner>,
    links: Vec<LinkEntry>,
}

struct LinkEntry {
    id: u64,
    central: String,
    peripheral: String,
    closed: watch::Sender<bool>,
}

/// A shared medium that in-memory radios talk through.
///
/// Clones share the medium. Each simulated device gets its own radio via
/// [`MemoryAir::radio`].
#[derive(Clone, Default)]
pub struct MemoryAir {
    state: Arc<Mutex<AirState>>,
    next_id: Arc<AtomicU64>,
}

impl MemoryAir {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AirState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A radio for device `device_id` supporting packets up to `mtu` bytes.
    pub fn radio(&self, device_id: impl Into<String>, mtu: usize) -> MemoryRadio {
        MemoryRadio {
            air: self.clone(),
            device_id: device_id.into(),
            mtu,
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Breaks every link between two devices, as if they moved out of range.
    pub fn sever(&self, a: &str, b: &str) -> usize {
        let mut state = self.lock();
        let mut severed = 0;
        state.links.retain(|link| {
            let matches = (link.central == a && link.peripheral == b)
                || (link.central == b && link.peripheral == a);
            if matches {
                link.closed.send_replace(true);
                severed += 1;
            }
            !matches
        });
        severed
    }

    /// Names currently advertised.
    pub fn advertised_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .advertisers
            .values()
            .map(|a| a.local_name.clone())
            .collect();
        names.sort();
        names
    }

    /// Number of active scans.
    pub fn active_scans(&self) -> usize {
        self.lock().scanners.len()
    }

    /// Number of open links.
    pub fn open_links(&self) -> usize {
        self.lock().links.len()
    }
}

/// In-memory radio for one simulated device.
#[derive(Clone)]
pub struct MemoryRadio {
    air: MemoryAir,
    device_id: String,
    mtu: usize,
    available: Arc<AtomicBool>,
}

impl MemoryRadio {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Simulates the radio being switched off or permission being revoked.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

#[async_trait]
impl BleRadio for MemoryRadio {
    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn advertise(
        &self,
        service: Uuid,
        local_name: &str,
    ) -> SyncResult<Box<dyn BleAdvertisement>> {
        if !self.is_available().await {
            return Err(SyncError::TransportUnavailable("radio off".to_string()));
        }
        let (incoming, rx) = mpsc::unbounded_channel();
        let device = BleDevice {
            id: self.device_id.clone(),
            local_name: local_name.to_string(),
        };
        let mut state = self.air.lock();
        for scanner in state.scanners.values() {
            if scanner.service == service && local_name.starts_with(&scanner.name_prefix) {
                let _ = scanner.found.send(device.clone());
            }
        }
        state.advertisers.insert(
            (self.device_id.clone(), local_name.to_string()),
            Advertiser {
                service,
                local_name: local_name.to_string(),
                mtu: self.mtu,
                incoming,
            },
        );
        debug!("{} advertising as {}", self.device_id, local_name);
        Ok(Box::new(MemoryAdvertisement {
            air: self.air.clone(),
            key: (self.device_id.clone(), local_name.to_string()),
            rx,
        }))
    }

    async fn scan(&self, service: Uuid, name_prefix: &str) -> SyncResult<Box<dyn BleScan>> {
        if !self.is_available().await {
            return Err(SyncError::TransportUnavailable("radio off".to_string()));
        }
        let (found, rx) = mpsc::unbounded_channel();
        let id = self.air.next_id.fetch_add(1, Ordering::Relaxed);
        let mut state = self.air.lock();
        for ((device_id, _), advertiser) in &state.advertisers {
            if advertiser.service == service && advertiser.local_name.starts_with(name_prefix) {
                let _ = found.send(BleDevice {
                    id: device_id.clone(),
                    local_name: advertiser.local_name.clone(),
                });
            }
        }
        state.scanners.insert(
            id,
            Scanner {
                service,
                name_prefix: name_prefix.to_string(),
                found,
            },
        );
        Ok(Box::new(MemoryScan {
            air: self.air.clone(),
            id,
            rx,
        }))
    }

    async fn connect(&self, device: &BleDevice) -> SyncResult<Arc<dyn BleLink>> {
        if !self.is_available().await {
            return Err(SyncError::TransportUnavailable("radio off".to_string()));
        }
        let mut state = self.air.lock();
        let key = (device.id.clone(), device.local_name.clone());
        let advertiser = state.advertisers.get(&key).ok_or_else(|| {
            SyncError::ConnectionFailed(format!(
                "device {} is not advertising {}",
                device.id, device.local_name
            ))
        })?;

        let mtu = self.mtu.min(advertiser.mtu);
        let link_id = self.air.next_id.fetch_add(1, Ordering::Relaxed);
        let (closed, closed_rx) = watch::channel(false);
        let (to_central, central_rx) = mpsc::unbounded_channel();
        let (to_peripheral, peripheral_rx) = mpsc::unbounded_channel();

        let central: Arc<dyn BleLink> = Arc::new(MemoryLink {
            link_id,
            peer_id: device.id.clone(),
            mtu,
            outgoing: to_peripheral,
            incoming: AsyncMutex::new(central_rx),
            closed: closed_rx.clone(),
            air: self.air.clone(),
        });
        let peripheral: Arc<dyn BleLink> = Arc::new(MemoryLink {
            link_id,
            peer_id: self.device_id.clone(),
            mtu,
            outgoing: to_central,
            incoming: AsyncMutex::new(peripheral_rx),
            closed: closed_rx,
            air: self.air.clone(),
        });

        advertiser.incoming.send(peripheral).map_err(|_| {
            SyncError::ConnectionFailed(format!("device {} stopped accepting", device.id))
        })?;
        state.links.push(LinkEntry {
            id: link_id,
            central: self.device_id.clone(),
            peripheral: device.id.clone(),
            closed,
        });
        debug!("{} connected to {} (mtu {})", self.device_id, device.id, mtu);
        Ok(central)
    }
}

struct MemoryAdvertisement {
    air: MemoryAir,
    key: (String, String),
    rx: mpsc::UnboundedReceiver<Arc<dyn BleLink>>,
}

#[async_trait]
impl BleAdvertisement for MemoryAdvertisement {
    async fn next_link(&mut self) -> Option<Arc<dyn BleLink>> {
        self.rx.recv().await
    }
}

impl Drop for MemoryAdvertisement {
    fn drop(&mut self) {
        self.air.lock().advertisers.remove(&self.key);
    }
}

struct MemoryScan {
    air: MemoryAir,
    id: u64,
    rx: mpsc::UnboundedReceiver<BleDevice>,
}

#[async_trait]
impl BleScan for MemoryScan {
    async fn next_device(&mut self) -> Option<BleDevice> {
        self.rx.recv().await
    }
}

impl Drop for MemoryScan {
    fn drop(&mut self) {
        self.air.lock().scanners.remove(&self.id);
    }
}

struct MemoryLink {
    link_id: u64,
    peer_id: String,
    mtu: usize,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    incoming: AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    closed: watch::Receiver<bool>,
    air: MemoryAir,
}

impl MemoryLink {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl BleLink for MemoryLink {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    async fn write(&self, packet: &[u8]) -> SyncResult<()> {
        if self.is_closed() {
            return Err(SyncError::Network(format!("link to {} closed", self.peer_id)));
        }
        if packet.len() > self.mtu {
            return Err(SyncError::Protocol(format!(
                "packet of {} bytes exceeds mtu {}",
                packet.len(),
                self.mtu
            )));
        }
        self.outgoing
            .send(packet.to_vec())
            .map_err(|_| SyncError::Network(format!("link to {} dropped", self.peer_id)))
    }

    async fn next_notification(&self) -> Option<Vec<u8>> {
        let mut closed = self.closed.clone();
        if *closed.borrow() {
            return None;
        }
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            packet = incoming.recv() => packet,
            _ = closed.wait_for(|c| *c) => None,
        }
    }

    async fn close(&self) {
        let mut state = self.air.lock();
        state.links.retain(|link| {
            if link.id == self.link_id {
                link.closed.send_replace(true);
                false
            } else {
                true
            }
        });
    }
}
