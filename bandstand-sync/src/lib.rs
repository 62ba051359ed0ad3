//! Multi-transport CRDT sync and sharing sessions for Bandstand.
//!
//! Provides three sync transports behind one [`SyncProvider`] contract:
//! - a cloud relay: broadcast channel for live updates plus blob snapshots
//! - Bluetooth LE: MTU-sized fragments, reassembled per peer
//! - a direct peer mesh
//!
//! # Architecture
//!
//! Every shared document is a [`Replica`](bandstand_crdt::Replica). A
//! provider binds one replica to one room; updates applied from the network
//! carry the provider's own origin and are never sent back out, so echo is
//! prevented without bookkeeping.
//!
//! ## Components
//!
//! - **EventBus**: typed in-process publish/subscribe with isolated handlers
//! - **Providers**: [`RelayProvider`], [`BleProvider`], [`DirectProvider`]
//! - **Factory**: [`TransportFactory`] builds providers from wired capabilities
//! - **Sessions**: [`SessionManager`] hosts and joins sharing sessions
//!
//! ## Session flow
//!
//! 1. **Host**: write the session document, hand out a join code or QR
//! 2. **Join**: derive the room namespace from the code, bind the session
//!    document, then every document it lists
//! 3. **Sync**: providers exchange state vectors and updates
//! 4. **End**: the host marks the session ended; joiners disconnect
//!
//! # Example
//!
//! ```
//! use bandstand_sync::{JoinCode, room_namespace};
//!
//! let code = JoinCode::generate().unwrap();
//! let parsed = JoinCode::parse(&code.to_string().to_lowercase().replace('-', " ")).unwrap();
//!
//! assert_eq!(parsed, code);
//! assert_eq!(parsed.room_namespace(), room_namespace(code.session_id(), code.secret()));
//! ```

pub mod ble;
mod config;
pub mod direct;
mod error;
pub mod events;
mod factory;
pub mod relay;
pub mod session;
pub mod transport;

pub use ble::BleProvider;
pub use config::{BANDSTAND_SERVICE_UUID, BleConfig, RelayConfig, SessionConfig, SyncConfig};
pub use direct::{DirectProvider, MemoryMesh, MeshEvent, MeshRoom, PeerMesh};
pub use error::{SyncError, SyncResult};
pub use events::{BusEvent, EventBus, HandlerResult, SubscriptionId};
pub use factory::TransportFactory;
pub use relay::{
    BlobStore, BroadcastRelay, FsBlobStore, MemoryBlobStore, MemoryRelay, RelayProvider,
};
pub use session::{
    BootstrapPayload, ConflictInfo, Invitation, JoinCode, JoinRequest, JsonSessionStore,
    LocalIdentity, MemorySessionStore, QrPayload, SeedEntry, SessionEvent, SessionEventKind,
    SessionManager, SessionRecord, SessionState, SessionStore, ShareKind, room_name, room_namespace,
};
pub use transport::{
    ErrorCause, PeerInfo, ProviderEvent, ProviderEventKind, ProviderFactory, ProviderSpec, Role,
    SyncProvider, TransportKind,
};
