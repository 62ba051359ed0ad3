//! Transport provider contract.
//!
//! A [`SyncProvider`] binds one [`Replica`] to one room on one transport.
//! Every provider shares the same shape:
//!
//! - updates received from the network are applied under the provider's own
//!   [`Origin`]
//! - local updates (any other origin) are forwarded to the network
//! - lifecycle and peer changes are reported on an [`EventBus`]

use crate::error::{SyncError, SyncResult};
use crate::events::{BusEvent, EventBus};
use async_trait::async_trait;
use bandstand_crdt::{Origin, Replica, UpdateSubscription};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Which transport a provider uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Cloud broadcast channel plus blob snapshots.
    Relay,
    /// Bluetooth LE with chunked writes.
    Ble,
    /// Direct peer mesh.
    Direct,
}

impl TransportKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Relay => "relay",
            Self::Ble => "ble",
            Self::Direct => "direct",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Side of a session a provider serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Joiner,
}

/// A remote participant as seen by a transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    /// Transport-scoped peer identifier.
    pub peer_id: String,
    /// Display name, when the transport carries one.
    #[serde(default)]
    pub display_name: Option<String>,
}

impl PeerInfo {
    pub fn new(peer_id: impl Into<String>, display_name: Option<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            display_name,
        }
    }

    /// Display name, falling back to the peer id.
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.peer_id)
    }
}

/// Events emitted by providers.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    PeerConnected(PeerInfo),
    PeerDisconnected(PeerInfo),
    /// The replica has caught up with the room.
    Synced,
    Status { connected: bool },
    /// Non-fatal failure; the provider keeps running.
    Error {
        message: String,
        cause: ErrorCause,
        /// Transport peer id of the sender, when the failure came from one.
        peer: Option<String>,
    },
}

/// What a provider [`ProviderEvent::Error`] is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCause {
    /// Radio, network, storage or framing trouble.
    Transport,
    /// The replica refused update bytes received from the room.
    RejectedUpdate,
}

/// Routing key for [`ProviderEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderEventKind {
    PeerConnected,
    PeerDisconnected,
    Synced,
    Status,
    Error,
}

impl BusEvent for ProviderEvent {
    type Kind = ProviderEventKind;

    fn kind(&self) -> ProviderEventKind {
        match self {
            Self::PeerConnected(_) => ProviderEventKind::PeerConnected,
            Self::PeerDisconnected(_) => ProviderEventKind::PeerDisconnected,
            Self::Synced => ProviderEventKind::Synced,
            Self::Status { .. } => ProviderEventKind::Status,
            Self::Error { .. } => ProviderEventKind::Error,
        }
    }
}

impl ProviderEvent {
    pub(crate) fn error(error: &SyncError) -> Self {
        Self::Error {
            message: error.to_string(),
            cause: ErrorCause::Transport,
            peer: None,
        }
    }

    /// An update that could not be applied; `peer` is the sender, if known.
    pub(crate) fn rejected_update(error: &SyncError, peer: Option<&str>) -> Self {
        Self::Error {
            message: error.to_string(),
            cause: ErrorCause::RejectedUpdate,
            peer: peer.map(str::to_string),
        }
    }
}

/// A replica bound to a room on one transport.
#[async_trait]
pub trait SyncProvider: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Room name (`<namespace>/<doc name>` inside sessions).
    fn room(&self) -> &str;

    fn replica(&self) -> &Replica;

    /// Starts syncing. Calling it on a connected provider is a no-op.
    async fn connect(&self) -> SyncResult<()>;

    /// Stops syncing and releases every task, link and subscription.
    /// Always safe to call.
    async fn disconnect(&self) -> SyncResult<()>;

    fn is_connected(&self) -> bool;

    fn is_synced(&self) -> bool;

    fn events(&self) -> &EventBus<ProviderEvent>;
}

/// Everything needed to build a provider.
#[derive(Debug, Clone)]
pub struct ProviderSpec {
    pub transport: TransportKind,
    pub replica: Replica,
    pub room: String,
    pub role: Role,
    /// The local participant, announced to peers.
    pub local: PeerInfo,
}

/// Builds providers for the session manager.
pub trait ProviderFactory: Send + Sync {
    fn create(&self, spec: ProviderSpec) -> SyncResult<Arc<dyn SyncProvider>>;
}

/// A fresh origin for one provider instance.
pub(crate) fn provider_origin(kind: TransportKind, room: &str) -> Origin {
    Origin::new(format!("{kind}:{room}:{}", uuid::Uuid::new_v4().simple()))
}

/// Local updates waiting to be sent, drained by a forwarder task.
///
/// Dropping the replica subscription closes the queue; [`Outbox::flush`]
/// then waits for the forwarder to send what is left.
pub(crate) struct Outbox {
    subscription: UpdateSubscription,
    forwarder: JoinHandle<()>,
}

impl Outbox {
    /// Observes `replica` and hands every update not carrying `origin` to `send`.
    pub(crate) fn start<F, Fut>(replica: &Replica, origin: Origin, send: F) -> SyncResult<Self>
    where
        F: Fn(Vec<u8>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let subscription = replica.on_update(move |update| {
            if update.is_from(&origin) {
                return;
            }
            if tx.send(update.bytes.to_vec()).is_err() {
                debug!("Outbox closed, dropping update");
            }
        })?;
        let forwarder = tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                send(bytes).await;
            }
        });
        Ok(Self {
            subscription,
            forwarder,
        })
    }

    /// Stops observing and waits until queued updates are sent.
    pub(crate) async fn flush(self) {
        drop(self.subscription);
        if let Err(e) = self.forwarder.await {
            if !e.is_cancelled() {
                debug!("Outbox forwarder ended abnormally: {}", e);
            }
        }
    }

    /// Stops observing and discards queued updates.
    pub(crate) fn abort(self) {
        drop(self.subscription);
        self.forwarder.abort();
    }
}
