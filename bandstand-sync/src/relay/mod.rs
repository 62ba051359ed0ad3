//! Cloud relay transport.
//!
//! Two capabilities back the relay provider:
//! - a [`BroadcastRelay`] delivering small messages to everyone in a room
//! - a [`BlobStore`] holding one full-state snapshot per room
//!
//! In-memory implementations of both are provided for tests and local
//! demos; [`FsBlobStore`] keeps snapshots in a synced folder.

mod blob;
mod channel;
mod provider;

pub use blob::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use channel::{
    BroadcastRelay, MemoryRelay, RelayEvent, RelayMessage, RelayRoom, RelayStats,
};
pub use provider::RelayProvider;
