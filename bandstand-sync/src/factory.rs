//! Provider construction from wired capabilities.

use crate::ble::{BleProvider, BleRadio};
use crate::config::SyncConfig;
use crate::direct::{DirectProvider, PeerMesh};
use crate::error::{SyncError, SyncResult};
use crate::relay::{BlobStore, BroadcastRelay, RelayProvider};
use crate::transport::{ProviderFactory, ProviderSpec, SyncProvider, TransportKind};
use std::sync::Arc;
use tracing::debug;

/// Builds providers for whichever transports the platform wired in.
///
/// A transport without its capability yields
/// [`SyncError::TransportUnavailable`].
#[derive(Clone, Default)]
pub struct TransportFactory {
    config: SyncConfig,
    relay: Option<(Arc<dyn BroadcastRelay>, Arc<dyn BlobStore>)>,
    radio: Option<Arc<dyn BleRadio>>,
    mesh: Option<Arc<dyn PeerMesh>>,
}

impl TransportFactory {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn with_relay(mut self, relay: Arc<dyn BroadcastRelay>, blobs: Arc<dyn BlobStore>) -> Self {
        self.relay = Some((relay, blobs));
        self
    }

    pub fn with_radio(mut self, radio: Arc<dyn BleRadio>) -> Self {
        self.radio = Some(radio);
        self
    }

    pub fn with_mesh(mut self, mesh: Arc<dyn PeerMesh>) -> Self {
        self.mesh = Some(mesh);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Transports this factory can build.
    pub fn available(&self) -> Vec<TransportKind> {
        let mut kinds = Vec::new();
        if self.relay.is_some() {
            kinds.push(TransportKind::Relay);
        }
        if self.radio.is_some() {
            kinds.push(TransportKind::Ble);
        }
        if self.mesh.is_some() {
            kinds.push(TransportKind::Direct);
        }
        kinds
    }
}

fn unavailable(kind: TransportKind) -> SyncError {
    SyncError::TransportUnavailable(format!("no {kind} capability configured"))
}

impl ProviderFactory for TransportFactory {
    fn create(&self, spec: ProviderSpec) -> SyncResult<Arc<dyn SyncProvider>> {
        debug!("Creating {} provider for room {}", spec.transport, spec.room);
        let provider: Arc<dyn SyncProvider> = match spec.transport {
            TransportKind::Relay => {
                let (relay, blobs) = self
                    .relay
                    .clone()
                    .ok_or_else(|| unavailable(TransportKind::Relay))?;
                Arc::new(RelayProvider::new(
                    spec.replica,
                    spec.room,
                    spec.local,
                    relay,
                    blobs,
                    self.config.relay.clone(),
                ))
            }
            TransportKind::Ble => {
                let radio = self.radio.clone().ok_or_else(|| unavailable(TransportKind::Ble))?;
                Arc::new(
                    BleProvider::new(
                        spec.replica,
                        spec.room,
                        spec.role,
                        radio,
                        self.config.ble.clone(),
                    )
                    .with_local(spec.local),
                )
            }
            TransportKind::Direct => {
                let mesh = self.mesh.clone().ok_or_else(|| unavailable(TransportKind::Direct))?;
                Arc::new(DirectProvider::new(spec.replica, spec.room, spec.local, mesh))
            }
        };
        Ok(provider)
    }
}
