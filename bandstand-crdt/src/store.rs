//! Document store adapter: one replica per logical name.

use crate::names::DocName;
use crate::replica::Replica;
use crate::views::{CollectionDoc, SessionDoc, SongDoc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Registry of open replicas.
///
/// Returns the same [`Replica`] for the same name for as long as the store
/// lives. Cloning the store shares the registry.
#[derive(Clone, Default)]
pub struct DocumentStore {
    replicas: Arc<Mutex<HashMap<DocName, Replica>>>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the replica for `name`, creating an empty one on first use.
    pub fn replica(&self, name: &DocName) -> Replica {
        let mut replicas = self.replicas.lock().unwrap_or_else(PoisonError::into_inner);
        replicas
            .entry(name.clone())
            .or_insert_with(|| {
                debug!("Opening replica {}", name);
                Replica::new(name.clone())
            })
            .clone()
    }

    /// Returns the replica for `name` only if it is already open.
    pub fn get(&self, name: &DocName) -> Option<Replica> {
        self.replicas
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Names of all open replicas, sorted.
    pub fn names(&self) -> Vec<DocName> {
        let mut names: Vec<DocName> = self
            .replicas
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Forgets a replica. Other holders of the handle keep their view.
    pub fn remove(&self, name: &DocName) -> Option<Replica> {
        self.replicas
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    pub fn song(&self, name: &DocName) -> SongDoc {
        SongDoc::new(self.replica(name))
    }

    /// Library or space view.
    pub fn collection(&self, name: &DocName) -> CollectionDoc {
        CollectionDoc::new(self.replica(name))
    }

    pub fn session(&self, name: &DocName) -> SessionDoc {
        SessionDoc::new(self.replica(name))
    }
}
