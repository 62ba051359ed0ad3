//! The replica capability.
//!
//! A [`Replica`] is a cheap, cloneable handle on one CRDT document. All
//! handles of the same replica share state; mutation and merge are
//! synchronous and run to completion.

use crate::error::{CrdtError, CrdtResult};
use crate::names::DocName;
use crate::origin::Origin;
use std::fmt;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Subscription, Transact, Update};

/// An update observed on a replica.
pub struct ReplicaUpdate<'a> {
    /// Encoded update bytes (v1 encoding).
    pub bytes: &'a [u8],
    origin: Option<&'a yrs::Origin>,
}

impl ReplicaUpdate<'_> {
    /// Whether the update was applied under `origin`.
    pub fn is_from(&self, origin: &Origin) -> bool {
        origin.matches(self.origin)
    }

    /// Whether the update came from a local edit (no origin marker).
    pub fn is_local(&self) -> bool {
        self.origin.is_none()
    }
}

/// Keeps an update observer registered. Dropping it unsubscribes.
pub struct UpdateSubscription {
    _inner: Subscription,
}

impl fmt::Debug for UpdateSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UpdateSubscription")
    }
}

/// A CRDT document with a well-known logical name.
#[derive(Clone)]
pub struct Replica {
    name: DocName,
    doc: Doc,
}

impl fmt::Debug for Replica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replica")
            .field("name", &self.name)
            .field("client_id", &self.doc.client_id())
            .finish()
    }
}

impl Replica {
    /// Creates an empty replica.
    pub fn new(name: DocName) -> Self {
        Self {
            name,
            doc: Doc::new(),
        }
    }

    /// Creates an empty replica with a fixed engine client id.
    ///
    /// Client ids must be unique per writer; tests use this to make
    /// concurrent edits deterministic.
    pub fn with_client_id(name: DocName, client_id: u64) -> Self {
        Self {
            name,
            doc: Doc::with_client_id(client_id),
        }
    }

    /// The logical name of this replica.
    pub fn name(&self) -> &DocName {
        &self.name
    }

    /// Underlying engine document, for the typed views.
    pub(crate) fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Applies remote update bytes under `origin`.
    ///
    /// Bytes that fail to decode leave the replica untouched. Updates whose
    /// causal dependencies are missing are held by the engine and integrate
    /// once the dependencies arrive.
    pub fn apply_update(&self, bytes: &[u8], origin: &Origin) -> CrdtResult<()> {
        let update = Update::decode_v1(bytes).map_err(|e| CrdtError::Decode(e.to_string()))?;
        let mut txn = self.doc.transact_mut_with(origin.as_yrs().clone());
        txn.apply_update(update)
            .map_err(|e| CrdtError::Apply(e.to_string()))
    }

    /// Encodes the full document state as a single update.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encodes the state vector ("what this replica has seen").
    pub fn encode_state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Encodes only what a peer with `state_vector` is missing.
    ///
    /// An empty state vector yields the full state.
    pub fn encode_diff(&self, state_vector: &[u8]) -> CrdtResult<Vec<u8>> {
        let sv = if state_vector.is_empty() {
            StateVector::default()
        } else {
            StateVector::decode_v1(state_vector).map_err(|e| CrdtError::Decode(e.to_string()))?
        };
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// Registers `callback` for every committed change, local or remote.
    pub fn on_update<F>(&self, callback: F) -> CrdtResult<UpdateSubscription>
    where
        F: Fn(&ReplicaUpdate<'_>) + Send + Sync + 'static,
    {
        let inner = self
            .doc
            .observe_update_v1(move |txn, event| {
                let update = ReplicaUpdate {
                    bytes: &event.update,
                    origin: txn.origin(),
                };
                callback(&update);
            })
            .map_err(|e| CrdtError::Observe(e.to_string()))?;
        Ok(UpdateSubscription { _inner: inner })
    }
}
