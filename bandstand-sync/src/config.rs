//! Configuration for providers and sessions.

use crate::error::SyncResult;
use crate::transport::TransportKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// GATT service advertised by Bandstand devices.
pub const BANDSTAND_SERVICE_UUID: Uuid = Uuid::from_u128(0x6d7a_0001_4b1e_4c5d_9b3e_8a4f_2c6e_1d00);

/// Top-level sync configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub relay: RelayConfig,
    pub ble: BleConfig,
    pub session: SessionConfig,
}

impl SyncConfig {
    /// Loads configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> SyncResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serializes configuration to JSON.
    pub fn to_json(&self) -> SyncResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Cloud relay configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// How often to upload a full snapshot (in seconds).
    pub snapshot_interval_secs: u64,
    /// Folder within blob storage holding snapshots.
    pub snapshot_folder: String,
    /// Messages buffered per room member before lagging members drop.
    pub channel_capacity: usize,
}

impl RelayConfig {
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs.max(1))
    }

    /// Blob path of the snapshot for `room`.
    pub fn snapshot_path(&self, room: &str) -> String {
        format!("{}/{}.ydoc", self.snapshot_folder.trim_end_matches('/'), room)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_secs: 30,
            snapshot_folder: "bandstand/snapshots".to_string(),
            channel_capacity: 256,
        }
    }
}

/// Bluetooth LE configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    pub service_uuid: Uuid,
    /// Prefix of the advertised local name.
    pub name_prefix: String,
    /// Default MTU when the link does not report one.
    pub mtu: usize,
    /// Largest reassembled message accepted from a peer (in bytes).
    pub max_message_size: usize,
    /// How long `disconnect` waits for queued writes (in milliseconds).
    pub flush_timeout_ms: u64,
}

impl BleConfig {
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            service_uuid: BANDSTAND_SERVICE_UUID,
            name_prefix: "BS-".to_string(),
            mtu: 512,
            max_message_size: 16 * 1024 * 1024, // 16 MB
            flush_timeout_ms: 500,
        }
    }
}

/// Session lifecycle configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Lifetime of a hosted session (in seconds).
    pub ttl_secs: u64,
    /// How often the expiry sweeper runs (in seconds).
    pub sweep_interval_secs: u64,
    /// Display-name prefix for transient guest identities.
    pub guest_name_prefix: String,
    /// Transport advertised in invitations.
    pub default_transport: TransportKind,
}

impl SessionConfig {
    pub fn ttl(&self) -> chrono::Duration {
        // Clamped to a year so expiry arithmetic cannot overflow.
        chrono::Duration::seconds(self.ttl_secs.min(365 * 24 * 60 * 60) as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 4 * 60 * 60,
            sweep_interval_secs: 60,
            guest_name_prefix: "Guest".to_string(),
            default_transport: TransportKind::Relay,
        }
    }
}
