//! Typed views over replicas.
//!
//! Every accessor is an idempotent creator: asking for a sub-structure that
//! does not exist yet attaches it, asking again returns the same attached
//! structure.

use crate::error::{CrdtError, CrdtResult};
use crate::replica::Replica;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;
use yrs::{Any, Array, ArrayRef, GetString, Map, MapRef, Out, Text, TextPrelim, TextRef, Transact};

const META: &str = "meta";
const ARRANGEMENTS: &str = "arrangements";
const TAGS: &str = "tags";
const SONG_IDS: &str = "songIds";
const SHARED: &str = "shared";
const PARTICIPANTS: &str = "participants";
const PRESENCE: &str = "presence";

const STATUS_KEY: &str = "status";
const STATUS_ENDED: &str = "ended";

fn out_to_string(value: Out) -> Option<String> {
    match value {
        Out::Any(Any::String(s)) => Some(s.to_string()),
        _ => None,
    }
}

// ── Primitive views ──────────────────────────────────────────────

/// Key-value map of string metadata.
#[derive(Clone)]
pub struct MetadataMap {
    replica: Replica,
    map: MapRef,
}

impl MetadataMap {
    fn attach(replica: &Replica, name: &str) -> Self {
        let map = replica.doc().get_or_insert_map(name);
        Self {
            replica: replica.clone(),
            map,
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let txn = self.replica.doc().transact();
        self.map.get(&txn, key).and_then(out_to_string)
    }

    pub fn set(&self, key: &str, value: impl Into<String>) {
        let mut txn = self.replica.doc().transact_mut();
        self.map.insert(&mut txn, key, value.into());
    }

    /// Removes a key, returning whether it was present.
    pub fn remove(&self, key: &str) -> bool {
        let mut txn = self.replica.doc().transact_mut();
        self.map.remove(&mut txn, key).is_some()
    }

    /// All string entries, sorted by key.
    pub fn entries(&self) -> BTreeMap<String, String> {
        let txn = self.replica.doc().transact();
        self.map
            .iter(&txn)
            .filter_map(|(k, v)| out_to_string(v).map(|v| (k.to_string(), v)))
            .collect()
    }

    /// Reads a JSON-encoded value.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> CrdtResult<Option<T>> {
        match self.get(key) {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Stores a value as JSON.
    pub fn set_json<T: Serialize>(&self, key: &str, value: &T) -> CrdtResult<()> {
        let raw = serde_json::to_string(value)?;
        self.set(key, raw);
        Ok(())
    }
}

/// Ordered list of strings (member ids, tags, document names).
#[derive(Clone)]
pub struct StringList {
    replica: Replica,
    array: ArrayRef,
}

impl StringList {
    fn attach(replica: &Replica, name: &str) -> Self {
        let array = replica.doc().get_or_insert_array(name);
        Self {
            replica: replica.clone(),
            array,
        }
    }

    pub fn items(&self) -> Vec<String> {
        let txn = self.replica.doc().transact();
        self.array.iter(&txn).filter_map(out_to_string).collect()
    }

    pub fn len(&self) -> usize {
        let txn = self.replica.doc().transact();
        self.array.len(&txn) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, item: &str) -> bool {
        self.items().iter().any(|i| i == item)
    }

    pub fn push(&self, item: impl Into<String>) {
        let mut txn = self.replica.doc().transact_mut();
        self.array.push_back(&mut txn, item.into());
    }

    /// Appends `item` unless it is already present. Returns whether it was added.
    pub fn push_unique(&self, item: &str) -> bool {
        let mut txn = self.replica.doc().transact_mut();
        let present = self
            .array
            .iter(&txn)
            .filter_map(out_to_string)
            .any(|i| i == item);
        if !present {
            self.array.push_back(&mut txn, item.to_string());
        }
        !present
    }

    /// Inserts at `index`, clamped to the list length.
    pub fn insert(&self, index: usize, item: impl Into<String>) {
        let mut txn = self.replica.doc().transact_mut();
        let len = self.array.len(&txn);
        let at = u32::try_from(index).unwrap_or(u32::MAX).min(len);
        self.array.insert(&mut txn, at, item.into());
    }

    /// Removes the first occurrence of `item`.
    pub fn remove(&self, item: &str) -> bool {
        let mut txn = self.replica.doc().transact_mut();
        let position = self
            .array
            .iter(&txn)
            .position(|v| out_to_string(v).as_deref() == Some(item));
        match position {
            Some(index) => {
                self.array.remove(&mut txn, index as u32);
                true
            }
            None => false,
        }
    }
}

/// Collaborative text (lyrics/chords of one arrangement).
#[derive(Clone)]
pub struct RichText {
    replica: Replica,
    text: TextRef,
}

impl RichText {
    pub fn get(&self) -> String {
        let txn = self.replica.doc().transact();
        self.text.get_string(&txn)
    }

    pub fn len(&self) -> u32 {
        let txn = self.replica.doc().transact();
        self.text.len(&txn)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn insert(&self, index: u32, chunk: &str) {
        let mut txn = self.replica.doc().transact_mut();
        self.text.insert(&mut txn, index, chunk);
    }

    pub fn push(&self, chunk: &str) {
        let mut txn = self.replica.doc().transact_mut();
        self.text.push(&mut txn, chunk);
    }

    pub fn delete(&self, index: u32, len: u32) {
        let mut txn = self.replica.doc().transact_mut();
        self.text.remove_range(&mut txn, index, len);
    }

    /// Replaces the whole content in one transaction.
    pub fn set(&self, content: &str) {
        let mut txn = self.replica.doc().transact_mut();
        let len = self.text.len(&txn);
        if len > 0 {
            self.text.remove_range(&mut txn, 0, len);
        }
        self.text.insert(&mut txn, 0, content);
    }
}

/// Map from sub-entity id to collaborative text.
#[derive(Clone)]
pub struct RichTextMap {
    replica: Replica,
    map: MapRef,
}

impl RichTextMap {
    fn attach(replica: &Replica, name: &str) -> Self {
        let map = replica.doc().get_or_insert_map(name);
        Self {
            replica: replica.clone(),
            map,
        }
    }

    /// Returns the text for `id`, attaching an empty one if missing.
    pub fn text(&self, id: &str) -> CrdtResult<RichText> {
        let mut txn = self.replica.doc().transact_mut();
        let text = match self.map.get(&txn, id) {
            Some(Out::YText(text)) => text,
            Some(_) => {
                return Err(CrdtError::Structure {
                    key: id.to_string(),
                    expected: "text",
                });
            }
            None => self.map.insert(&mut txn, id, TextPrelim::new("")),
        };
        Ok(RichText {
            replica: self.replica.clone(),
            text,
        })
    }

    /// Ids that currently have a text attached, sorted.
    pub fn ids(&self) -> Vec<String> {
        let txn = self.replica.doc().transact();
        let mut ids: Vec<String> = self.map.keys(&txn).map(str::to_string).collect();
        ids.sort();
        ids
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut txn = self.replica.doc().transact_mut();
        self.map.remove(&mut txn, id).is_some()
    }
}

/// Map from key to a JSON-encoded record.
#[derive(Clone)]
struct RecordMap {
    replica: Replica,
    map: MapRef,
}

impl RecordMap {
    fn attach(replica: &Replica, name: &str) -> Self {
        let map = replica.doc().get_or_insert_map(name);
        Self {
            replica: replica.clone(),
            map,
        }
    }

    fn put<T: Serialize>(&self, key: &str, record: &T) -> CrdtResult<()> {
        let raw = serde_json::to_string(record)?;
        let mut txn = self.replica.doc().transact_mut();
        self.map.insert(&mut txn, key, raw);
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let txn = self.replica.doc().transact();
        let raw = self.map.get(&txn, key).and_then(out_to_string)?;
        serde_json::from_str(&raw).ok()
    }

    fn all<T: DeserializeOwned>(&self) -> BTreeMap<String, T> {
        let txn = self.replica.doc().transact();
        let mut records = BTreeMap::new();
        for (key, value) in self.map.iter(&txn) {
            let Some(raw) = out_to_string(value) else {
                continue;
            };
            match serde_json::from_str(&raw) {
                Ok(record) => {
                    records.insert(key.to_string(), record);
                }
                Err(e) => warn!("Skipping malformed record {}: {}", key, e),
            }
        }
        records
    }

    fn remove(&self, key: &str) -> bool {
        let mut txn = self.replica.doc().transact_mut();
        self.map.remove(&mut txn, key).is_some()
    }

    fn clear(&self) {
        let mut txn = self.replica.doc().transact_mut();
        self.map.clear(&mut txn);
    }
}

// ── Entity views ─────────────────────────────────────────────────

/// A song: metadata, per-arrangement text, tags.
#[derive(Clone)]
pub struct SongDoc {
    replica: Replica,
    metadata: MetadataMap,
    arrangements: RichTextMap,
    tags: StringList,
}

impl SongDoc {
    pub fn new(replica: Replica) -> Self {
        Self {
            metadata: MetadataMap::attach(&replica, META),
            arrangements: RichTextMap::attach(&replica, ARRANGEMENTS),
            tags: StringList::attach(&replica, TAGS),
            replica,
        }
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn metadata(&self) -> MetadataMap {
        self.metadata.clone()
    }

    pub fn arrangements(&self) -> RichTextMap {
        self.arrangements.clone()
    }

    pub fn tags(&self) -> StringList {
        self.tags.clone()
    }

    pub fn title(&self) -> Option<String> {
        self.metadata.get("title")
    }

    pub fn set_title(&self, title: impl Into<String>) {
        self.metadata.set("title", title);
    }
}

/// A library or shared space: metadata and an ordered list of song ids.
#[derive(Clone)]
pub struct CollectionDoc {
    replica: Replica,
    metadata: MetadataMap,
    song_ids: StringList,
}

impl CollectionDoc {
    pub fn new(replica: Replica) -> Self {
        Self {
            metadata: MetadataMap::attach(&replica, META),
            song_ids: StringList::attach(&replica, SONG_IDS),
            replica,
        }
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn metadata(&self) -> MetadataMap {
        self.metadata.clone()
    }

    pub fn song_ids(&self) -> StringList {
        self.song_ids.clone()
    }
}

/// One roster entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub display_name: String,
    pub joined_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl Participant {
    pub fn joined_now(display_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            display_name: display_name.into(),
            joined_at: now,
            last_seen_at: now,
        }
    }
}

/// Ephemeral position broadcast by a participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceState {
    #[serde(default)]
    pub song_id: Option<String>,
    #[serde(default)]
    pub arrangement_id: Option<String>,
    #[serde(default)]
    pub position: Option<u32>,
    pub updated_at: DateTime<Utc>,
}

/// The in-session document: metadata, shared document names, roster, presence.
///
/// Roster and presence live only here, never in durable storage.
#[derive(Clone)]
pub struct SessionDoc {
    replica: Replica,
    metadata: MetadataMap,
    shared: StringList,
    participants: RecordMap,
    presence: RecordMap,
}

impl SessionDoc {
    pub fn new(replica: Replica) -> Self {
        Self {
            metadata: MetadataMap::attach(&replica, META),
            shared: StringList::attach(&replica, SHARED),
            participants: RecordMap::attach(&replica, PARTICIPANTS),
            presence: RecordMap::attach(&replica, PRESENCE),
            replica,
        }
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn metadata(&self) -> MetadataMap {
        self.metadata.clone()
    }

    /// Logical names of the documents exposed to joiners.
    pub fn shared_documents(&self) -> StringList {
        self.shared.clone()
    }

    pub fn upsert_participant(&self, user_id: &str, participant: &Participant) -> CrdtResult<()> {
        self.participants.put(user_id, participant)
    }

    pub fn participant(&self, user_id: &str) -> Option<Participant> {
        self.participants.get(user_id)
    }

    pub fn participants(&self) -> BTreeMap<String, Participant> {
        self.participants.all()
    }

    pub fn remove_participant(&self, user_id: &str) -> bool {
        self.participants.remove(user_id)
    }

    /// Bumps `last_seen_at` for a known participant.
    pub fn touch_participant(&self, user_id: &str, at: DateTime<Utc>) -> CrdtResult<bool> {
        match self.participant(user_id) {
            Some(mut participant) => {
                participant.last_seen_at = at;
                self.participants.put(user_id, &participant)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn clear_participants(&self) {
        self.participants.clear();
    }

    pub fn set_presence(&self, user_id: &str, state: &PresenceState) -> CrdtResult<()> {
        self.presence.put(user_id, state)
    }

    pub fn presence(&self) -> BTreeMap<String, PresenceState> {
        self.presence.all()
    }

    pub fn clear_presence(&self, user_id: &str) -> bool {
        self.presence.remove(user_id)
    }

    pub fn mark_ended(&self) {
        self.metadata.set(STATUS_KEY, STATUS_ENDED);
    }

    pub fn is_ended(&self) -> bool {
        self.metadata.get(STATUS_KEY).as_deref() == Some(STATUS_ENDED)
    }
}
