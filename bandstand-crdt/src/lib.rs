//! Replicated documents for Bandstand.
//!
//! The CRDT engine itself is [`yrs`]; this crate wraps it in the narrow
//! capability the sync layer relies on:
//!
//! - [`Replica`]: apply/encode updates and state vectors, observe changes
//! - [`Origin`]: marker attached to applied updates, used for echo suppression
//! - [`DocumentStore`]: one replica per logical name (`song-<id>`, ...)
//! - typed views ([`SongDoc`], [`CollectionDoc`], [`SessionDoc`]) whose
//!   sub-structure accessors create on first use and never duplicate
//!
//! Merges are commutative, associative and idempotent: replicas that have
//! seen the same set of updates hold the same content regardless of delivery
//! order or duplication.

mod error;
mod names;
mod origin;
mod replica;
mod store;
mod views;

pub use error::{CrdtError, CrdtResult};
pub use names::{DocKind, DocName};
pub use origin::Origin;
pub use replica::{Replica, ReplicaUpdate, UpdateSubscription};
pub use store::DocumentStore;
pub use views::{
    CollectionDoc, MetadataMap, Participant, PresenceState, RichText, RichTextMap, SessionDoc,
    SongDoc, StringList,
};
