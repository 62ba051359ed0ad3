//! Join payloads: spoken join codes, QR payloads and bootstrap bundles.
//!
//! A join code is six words from [`WORD_LIST`]. The first three words form
//! the session id, the last three the join secret:
//!
//! ```text
//! HARBOR-OLIVE-PEARL-TANGO-EMBER-KILO
//! \____ session ____/ \___ secret ___/
//! ```
//!
//! Every transport room of a session lives under a namespace derived from
//! both halves, so knowing the session id alone is not enough to join.

use crate::error::{SyncError, SyncResult};
use crate::transport::TransportKind;
use bandstand_crdt::DocName;
use bandstand_types::SessionId;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Word list for human-readable join codes.
/// Common, easy-to-spell words for reading aloud across a rehearsal room.
pub const WORD_LIST: &[&str] = &[
    "APPLE", "BANANA", "CHERRY", "DELTA", "ECHO", "FOXTROT", "GRAPE", "HOTEL",
    "INDIA", "JULIET", "KILO", "LIMA", "MANGO", "NOVEMBER", "OSCAR", "PAPA",
    "QUEBEC", "ROMEO", "SIERRA", "TANGO", "ULTRA", "VICTOR", "WHISKEY", "XRAY",
    "YANKEE", "ZULU", "AMBER", "BRONZE", "CORAL", "DENIM", "EMBER", "FROST",
    "GOLDEN", "HARBOR", "IVORY", "JADE", "KARMA", "LEMON", "MAPLE", "NAVY",
    "OLIVE", "PEARL", "QUARTZ", "RUBY", "SAGE", "TOPAZ", "UNITY", "VELVET",
    "WILLOW", "XENON", "YELLOW", "ZINC", "ARCTIC", "BLAZE", "CLOUD", "DAWN",
    "EAGLE", "FLAME", "GLACIER", "HORIZON", "ISLAND", "JUNGLE", "KNIGHT", "LUNAR",
];

const WORDS_PER_HALF: usize = 3;

/// URI prefix of QR payloads.
pub const QR_PREFIX: &str = "bandstand:join:";

/// Namespace shared by every room of a session: the first 16 hex characters
/// of `SHA-256("<session id>:<secret>")`.
pub fn room_namespace(session_id: &SessionId, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(session_id.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(secret.as_bytes());
    let mut hash = hex::encode(hasher.finalize());
    hash.truncate(16);
    hash
}

/// Room of one document inside a session namespace.
pub fn room_name(namespace: &str, doc: &DocName) -> String {
    format!("{namespace}/{doc}")
}

fn random_words(count: usize) -> Vec<&'static str> {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| WORD_LIST[rng.gen_range(0..WORD_LIST.len())])
        .collect()
}

/// A parsed or generated join code.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JoinCode {
    session_id: SessionId,
    secret: String,
}

impl JoinCode {
    /// Generates a new random code.
    /// ~36 bits of entropy in total (64^6), half of which guards the secret.
    pub fn generate() -> SyncResult<Self> {
        let words = random_words(WORDS_PER_HALF * 2);
        let (session, secret) = words.split_at(WORDS_PER_HALF);
        Ok(Self {
            session_id: SessionId::new(session.join("-"))?,
            secret: secret.join("-").to_lowercase(),
        })
    }

    /// Parses user input. Case, surrounding whitespace, spaces and
    /// underscores between words are all tolerated.
    pub fn parse(input: &str) -> SyncResult<Self> {
        let normalized = input.trim().to_uppercase().replace([' ', '_'], "-");
        let words: Vec<&str> = normalized.split('-').filter(|w| !w.is_empty()).collect();
        if words.len() != WORDS_PER_HALF * 2 {
            return Err(SyncError::InvalidJoinCode(format!(
                "expected {} words, got {}",
                WORDS_PER_HALF * 2,
                words.len()
            )));
        }
        let is_known = |word: &str| WORD_LIST.iter().any(|known| *known == word);
        if let Some(unknown) = words.iter().find(|w| !is_known(w)) {
            return Err(SyncError::InvalidJoinCode(format!("unknown word {unknown}")));
        }
        let (session, secret) = words.split_at(WORDS_PER_HALF);
        let session_id = SessionId::new(session.join("-"))
            .map_err(|e| SyncError::InvalidJoinCode(e.to_string()))?;
        Ok(Self {
            session_id,
            secret: secret.join("-").to_lowercase(),
        })
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn room_namespace(&self) -> String {
        room_namespace(&self.session_id, &self.secret)
    }
}

impl fmt::Display for JoinCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}",
            self.session_id.as_str().to_uppercase(),
            self.secret.to_uppercase()
        )
    }
}

/// Contents of an invitation QR code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrPayload {
    pub session_id: SessionId,
    pub join_secret: String,
    pub transport: TransportKind,
}

impl QrPayload {
    pub fn new(code: &JoinCode, transport: TransportKind) -> Self {
        Self {
            session_id: code.session_id.clone(),
            join_secret: code.secret.clone(),
            transport,
        }
    }

    /// `bandstand:join:` followed by base64url of the JSON body.
    pub fn encode(&self) -> SyncResult<String> {
        let json = serde_json::to_vec(self)?;
        Ok(format!("{QR_PREFIX}{}", URL_SAFE_NO_PAD.encode(json)))
    }

    pub fn decode(payload: &str) -> SyncResult<Self> {
        let body = payload
            .trim()
            .strip_prefix(QR_PREFIX)
            .ok_or_else(|| SyncError::InvalidJoinCode("not a bandstand join payload".to_string()))?;
        let json = URL_SAFE_NO_PAD
            .decode(body.trim_end_matches('='))
            .map_err(|e| SyncError::InvalidJoinCode(format!("bad base64: {e}")))?;
        serde_json::from_slice(&json)
            .map_err(|e| SyncError::InvalidJoinCode(format!("bad payload: {e}")))
    }

    pub fn room_namespace(&self) -> String {
        room_namespace(&self.session_id, &self.join_secret)
    }
}

/// Initial state of one document carried in a bootstrap payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedEntry {
    pub name: DocName,
    pub state: Vec<u8>,
}

/// Everything a joiner needs to start without a network round trip:
/// credentials plus seed states of the shared songs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapPayload {
    pub session_id: SessionId,
    pub join_secret: String,
    /// Seed entries in the binary layout of [`encode_song_data`], base64.
    #[serde(with = "song_data_b64")]
    pub song_data: Vec<u8>,
}

mod song_data_b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        STANDARD.decode(raw).map_err(serde::de::Error::custom)
    }
}

impl BootstrapPayload {
    pub fn new(code: &JoinCode, seeds: &[SeedEntry]) -> SyncResult<Self> {
        Ok(Self {
            session_id: code.session_id.clone(),
            join_secret: code.secret.clone(),
            song_data: encode_song_data(seeds)?,
        })
    }

    pub fn seeds(&self) -> SyncResult<Vec<SeedEntry>> {
        decode_song_data(&self.song_data)
    }

    pub fn room_namespace(&self) -> String {
        room_namespace(&self.session_id, &self.join_secret)
    }

    pub fn to_json(&self) -> SyncResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> SyncResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| SyncError::InvalidJoinCode(format!("bad bootstrap payload: {e}")))
    }
}

/// Encodes seeds as repeated `[u16 name len][name][u32 state len][state]`,
/// big endian.
pub fn encode_song_data(seeds: &[SeedEntry]) -> SyncResult<Vec<u8>> {
    let mut out = Vec::new();
    for seed in seeds {
        let name = seed.name.to_string();
        let name_len = u16::try_from(name.len())
            .map_err(|_| SyncError::Protocol(format!("document name too long: {name}")))?;
        let state_len = u32::try_from(seed.state.len())
            .map_err(|_| SyncError::Protocol(format!("seed for {name} too large")))?;
        out.extend_from_slice(&name_len.to_be_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&state_len.to_be_bytes());
        out.extend_from_slice(&seed.state);
    }
    Ok(out)
}

fn take<'a>(bytes: &mut &'a [u8], len: usize, what: &str) -> SyncResult<&'a [u8]> {
    if bytes.len() < len {
        return Err(SyncError::InvalidJoinCode(format!("truncated song data ({what})")));
    }
    let (head, rest) = bytes.split_at(len);
    *bytes = rest;
    Ok(head)
}

/// Decodes the layout written by [`encode_song_data`].
pub fn decode_song_data(mut bytes: &[u8]) -> SyncResult<Vec<SeedEntry>> {
    let mut seeds = Vec::new();
    while !bytes.is_empty() {
        let name_len = take(&mut bytes, 2, "name length")?;
        let name_len = u16::from_be_bytes([name_len[0], name_len[1]]) as usize;
        let name = take(&mut bytes, name_len, "name")?;
        let name = std::str::from_utf8(name)
            .map_err(|_| SyncError::InvalidJoinCode("document name is not UTF-8".to_string()))?;
        let name = DocName::parse(name).map_err(|e| SyncError::InvalidJoinCode(e.to_string()))?;
        let state_len = take(&mut bytes, 4, "state length")?;
        let state_len =
            u32::from_be_bytes([state_len[0], state_len[1], state_len[2], state_len[3]]) as usize;
        let state = take(&mut bytes, state_len, "state")?.to_vec();
        seeds.push(SeedEntry { name, state });
    }
    Ok(seeds)
}
