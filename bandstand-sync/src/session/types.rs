//! Session records, identities and events.

use super::code::{BootstrapPayload, JoinCode};
use crate::events::BusEvent;
use crate::transport::{Role, TransportKind};
use bandstand_crdt::DocName;
use bandstand_types::{SessionId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a host shares.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ShareKind {
    /// The owner's entire library.
    Library { owner: UserId },
    /// One collection (space) of songs.
    Space { id: String },
}

impl ShareKind {
    /// Collection document listing the shared songs.
    pub fn collection(&self) -> crate::error::SyncResult<DocName> {
        Ok(match self {
            Self::Library { owner } => DocName::library(owner),
            Self::Space { id } => DocName::space(id.as_str())?,
        })
    }
}

/// Lifecycle of a session on this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Hosting,
    Joining,
    Active,
    Ended,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Hosting => "hosting",
            Self::Joining => "joining",
            Self::Active => "active",
            Self::Ended => "ended",
        };
        f.write_str(name)
    }
}

/// Durable part of a session: enough to reconnect after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: SessionId,
    /// Unknown to a joiner until the session document arrives.
    #[serde(default)]
    pub host_id: Option<UserId>,
    #[serde(default)]
    pub kind: Option<ShareKind>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub shared: Vec<DocName>,
    pub join_secret: String,
    pub role: Role,
    pub transport: TransportKind,
}

impl SessionRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_host(&self) -> bool {
        self.role == Role::Host
    }

    pub fn document(&self) -> DocName {
        DocName::session(&self.id)
    }
}

/// Who this device acts as inside sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalIdentity {
    pub user_id: UserId,
    pub display_name: String,
    /// Transient identity created for a join without a signed-in user.
    #[serde(default)]
    pub guest: bool,
}

impl LocalIdentity {
    pub fn new(user_id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            guest: false,
        }
    }

    /// A fresh guest named `<prefix> <4 digits>`.
    pub fn guest(prefix: &str) -> Self {
        use rand::Rng;
        let suffix: u16 = rand::thread_rng().gen_range(0..10_000);
        Self {
            user_id: UserId::new(),
            display_name: format!("{prefix} {suffix:04}"),
            guest: true,
        }
    }
}

/// What the host hands out to let others join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invitation {
    pub session_id: SessionId,
    pub join_code: JoinCode,
    /// Encoded QR payload.
    pub qr: String,
    pub transport: TransportKind,
    pub room_namespace: String,
}

/// The three ways to join a session.
#[derive(Debug, Clone)]
pub enum JoinRequest {
    /// A spoken or typed join code.
    Code { code: String, transport: TransportKind },
    /// A scanned QR payload (`bandstand:join:...`).
    Qr(String),
    /// Credentials plus seed states, for joining without a round trip.
    Bootstrap {
        payload: BootstrapPayload,
        transport: TransportKind,
    },
}

/// Events published by the session manager.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        session_id: SessionId,
        state: SessionState,
    },
    ParticipantJoined {
        session_id: SessionId,
        user_id: String,
        display_name: String,
    },
    ParticipantLeft {
        session_id: SessionId,
        user_id: String,
    },
    SharedDocumentAdded {
        session_id: SessionId,
        document: DocName,
    },
    /// A provider failed, or a document moved to another session here. The
    /// session keeps running.
    Warning {
        session_id: SessionId,
        message: String,
    },
    Ended {
        session_id: SessionId,
    },
}

/// Routing key for [`SessionEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEventKind {
    StateChanged,
    ParticipantJoined,
    ParticipantLeft,
    SharedDocumentAdded,
    Warning,
    Ended,
}

impl BusEvent for SessionEvent {
    type Kind = SessionEventKind;

    fn kind(&self) -> SessionEventKind {
        match self {
            Self::StateChanged { .. } => SessionEventKind::StateChanged,
            Self::ParticipantJoined { .. } => SessionEventKind::ParticipantJoined,
            Self::ParticipantLeft { .. } => SessionEventKind::ParticipantLeft,
            Self::SharedDocumentAdded { .. } => SessionEventKind::SharedDocumentAdded,
            Self::Warning { .. } => SessionEventKind::Warning,
            Self::Ended { .. } => SessionEventKind::Ended,
        }
    }
}

impl SessionEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::StateChanged { session_id, .. }
            | Self::ParticipantJoined { session_id, .. }
            | Self::ParticipantLeft { session_id, .. }
            | Self::SharedDocumentAdded { session_id, .. }
            | Self::Warning { session_id, .. }
            | Self::Ended { session_id } => session_id,
        }
    }
}
