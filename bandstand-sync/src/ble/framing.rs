//! Packet framing for MTU-limited links.
//!
//! Every packet starts with one header byte:
//!
//! | bit | meaning |
//! |-----|---------|
//! | 7 (`0x80`) | fragment of a larger message |
//! | 6 (`0x40`) | final fragment |
//! | 5 (`0x20`) | control packet |
//!
//! A message that fits in `mtu - 1` bytes travels as one packet with header
//! `0x00`. Larger messages are split into `ceil(len / (mtu - 1))` fragments;
//! only the last carries `0x40`. Control packets are never fragmented: the
//! body is a one-byte control code ([`SYNC_REQUEST`], [`HELLO`]) followed by
//! its argument.

use crate::error::{SyncError, SyncResult};
use crate::transport::PeerInfo;

pub const FRAGMENT: u8 = 0x80;
pub const FINAL: u8 = 0x40;
pub const CONTROL: u8 = 0x20;

/// Control code: body is the sender's state vector; answer with a diff.
pub const SYNC_REQUEST: u8 = 0x01;

/// Control code: body is `[u8 id len][id][display name]`, both UTF-8.
pub const HELLO: u8 = 0x02;

/// A parsed packet, borrowing from the raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet<'a> {
    /// Complete message in one packet.
    Whole(&'a [u8]),
    /// One piece of a fragmented message.
    Fragment { last: bool, chunk: &'a [u8] },
    /// Control packet.
    Control { code: u8, body: &'a [u8] },
}

fn payload_capacity(mtu: usize) -> SyncResult<usize> {
    if mtu < 2 {
        return Err(SyncError::Protocol(format!("mtu {mtu} too small for framing")));
    }
    Ok(mtu - 1)
}

/// Splits `payload` into packets no larger than `mtu`.
pub fn fragment(payload: &[u8], mtu: usize) -> SyncResult<Vec<Vec<u8>>> {
    let capacity = payload_capacity(mtu)?;
    if payload.len() <= capacity {
        let mut packet = Vec::with_capacity(payload.len() + 1);
        packet.push(0);
        packet.extend_from_slice(payload);
        return Ok(vec![packet]);
    }

    let count = payload.len().div_ceil(capacity);
    let packets = payload
        .chunks(capacity)
        .enumerate()
        .map(|(i, chunk)| {
            let header = if i + 1 == count { FRAGMENT | FINAL } else { FRAGMENT };
            let mut packet = Vec::with_capacity(chunk.len() + 1);
            packet.push(header);
            packet.extend_from_slice(chunk);
            packet
        })
        .collect();
    Ok(packets)
}

/// Builds a sync-request control packet.
///
/// If the state vector does not fit the MTU, an empty one is sent instead,
/// which asks the peer for its full state.
pub fn sync_request(state_vector: &[u8], mtu: usize) -> SyncResult<Vec<u8>> {
    let capacity = payload_capacity(mtu)?;
    let body = if state_vector.len() < capacity {
        state_vector
    } else {
        &[]
    };
    let mut packet = Vec::with_capacity(body.len() + 2);
    packet.push(CONTROL);
    packet.push(SYNC_REQUEST);
    packet.extend_from_slice(body);
    Ok(packet)
}

/// Builds a hello control packet announcing `local`.
///
/// The display name is cut at a character boundary to fit the MTU. Returns
/// `None` when even the peer id does not fit.
pub fn hello(local: &PeerInfo, mtu: usize) -> SyncResult<Option<Vec<u8>>> {
    payload_capacity(mtu)?;
    let id = local.peer_id.as_bytes();
    let Ok(id_len) = u8::try_from(id.len()) else {
        return Ok(None);
    };
    // Header, code and id length byte.
    let fixed = 3 + id.len();
    if fixed > mtu {
        return Ok(None);
    }
    let room = mtu - fixed;
    let name = local.display_name.as_deref().unwrap_or_default();
    let mut end = name.len().min(room);
    while !name.is_char_boundary(end) {
        end -= 1;
    }

    let mut packet = Vec::with_capacity(fixed + end);
    packet.push(CONTROL);
    packet.push(HELLO);
    packet.push(id_len);
    packet.extend_from_slice(id);
    packet.extend_from_slice(&name.as_bytes()[..end]);
    Ok(Some(packet))
}

/// Reads the body of a [`HELLO`] control packet.
pub fn parse_hello(body: &[u8]) -> SyncResult<PeerInfo> {
    let (&id_len, rest) = body
        .split_first()
        .ok_or_else(|| SyncError::Protocol("empty hello".to_string()))?;
    let id_len = usize::from(id_len);
    if id_len == 0 || rest.len() < id_len {
        return Err(SyncError::Protocol(format!("hello with bad id length {id_len}")));
    }
    let (id, name) = rest.split_at(id_len);
    let text = |bytes: &[u8]| {
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|e| SyncError::Protocol(format!("hello is not UTF-8: {e}")))
    };
    let name = text(name)?;
    Ok(PeerInfo::new(text(id)?, (!name.is_empty()).then_some(name)))
}

/// Parses a raw packet.
pub fn parse(packet: &[u8]) -> SyncResult<Packet<'_>> {
    let (&header, rest) = packet
        .split_first()
        .ok_or_else(|| SyncError::Protocol("empty packet".to_string()))?;

    if header & CONTROL != 0 {
        if header & FRAGMENT != 0 {
            return Err(SyncError::Protocol(format!(
                "fragmented control packet (header {header:#04x})"
            )));
        }
        let (&code, body) = rest
            .split_first()
            .ok_or_else(|| SyncError::Protocol("control packet without code".to_string()))?;
        return Ok(Packet::Control { code, body });
    }

    if header & FRAGMENT != 0 {
        return Ok(Packet::Fragment {
            last: header & FINAL != 0,
            chunk: rest,
        });
    }
    if header & FINAL != 0 {
        return Err(SyncError::Protocol(format!(
            "final bit without fragment bit (header {header:#04x})"
        )));
    }
    Ok(Packet::Whole(rest))
}
