//! Well-known logical document names.

use crate::error::{CrdtError, CrdtResult};
use bandstand_types::{SessionId, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of domain entity a replica holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocKind {
    Song,
    Library,
    Space,
    Session,
}

impl DocKind {
    /// Prefix used in the logical name.
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Song => "song",
            Self::Library => "library",
            Self::Space => "space",
            Self::Session => "session",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "song" => Some(Self::Song),
            "library" => Some(Self::Library),
            "space" => Some(Self::Space),
            "session" => Some(Self::Session),
            _ => None,
        }
    }
}

/// Globally unique logical name of a replica, e.g. `song-42`.
///
/// The id part may not contain `/`, which separates document names inside
/// transport room names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocName {
    kind: DocKind,
    id: String,
}

impl DocName {
    /// Builds a name from a kind and an entity id.
    pub fn new(kind: DocKind, id: impl Into<String>) -> CrdtResult<Self> {
        let id = id.into();
        if id.is_empty() || id.contains('/') || id.chars().any(char::is_whitespace) {
            return Err(CrdtError::InvalidName(format!("{}-{id}", kind.prefix())));
        }
        Ok(Self { kind, id })
    }

    /// `song-<id>`.
    pub fn song(id: impl Into<String>) -> CrdtResult<Self> {
        Self::new(DocKind::Song, id)
    }

    /// `library-<user>`.
    pub fn library(owner: &UserId) -> Self {
        Self {
            kind: DocKind::Library,
            id: owner.to_string(),
        }
    }

    /// `space-<id>`.
    pub fn space(id: impl Into<String>) -> CrdtResult<Self> {
        Self::new(DocKind::Space, id)
    }

    /// `session-<id>`.
    pub fn session(id: &SessionId) -> Self {
        Self {
            kind: DocKind::Session,
            id: id.to_string(),
        }
    }

    /// Parses `<prefix>-<id>`.
    pub fn parse(raw: &str) -> CrdtResult<Self> {
        let (prefix, id) = raw
            .split_once('-')
            .ok_or_else(|| CrdtError::InvalidName(raw.to_string()))?;
        let kind =
            DocKind::from_prefix(prefix).ok_or_else(|| CrdtError::InvalidName(raw.to_string()))?;
        Self::new(kind, id)
    }

    pub fn kind(&self) -> DocKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for DocName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.kind.prefix(), self.id)
    }
}

impl FromStr for DocName {
    type Err = CrdtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DocName {
    type Error = CrdtError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DocName> for String {
    fn from(name: DocName) -> Self {
        name.to_string()
    }
}
