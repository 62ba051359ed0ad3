//! Ad-hoc sharing sessions.

mod code;
mod manager;
mod store;
mod types;

pub use code::{
    BootstrapPayload, JoinCode, QR_PREFIX, QrPayload, SeedEntry, WORD_LIST, decode_song_data,
    encode_song_data, room_name, room_namespace,
};
pub use manager::SessionManager;
pub use store::{ConflictInfo, JsonSessionStore, MemorySessionStore, SessionStore};
pub use types::{
    Invitation, JoinRequest, LocalIdentity, SessionEvent, SessionEventKind, SessionRecord,
    SessionState, ShareKind,
};
