//! Bluetooth LE transport.
//!
//! Updates are split into MTU-sized packets ([`framing`]), written in order
//! per peer and reassembled per peer on the other side ([`Reassembler`]).

pub mod framing;
mod provider;
mod radio;
mod reassembly;

pub use provider::{BleProvider, room_tag};
pub use radio::{BleAdvertisement, BleDevice, BleLink, BleRadio, BleScan, MemoryAir, MemoryRadio};
pub use reassembly::Reassembler;
