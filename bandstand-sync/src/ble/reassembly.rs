//! Per-peer reassembly of fragmented messages.

use crate::error::{SyncError, SyncResult};
use std::collections::HashMap;

/// Accumulates fragments per peer until the final fragment arrives.
///
/// Buffers are created on the first fragment from a peer and destroyed on
/// its final fragment, on overflow, or by [`purge`](Self::purge).
#[derive(Debug)]
pub struct Reassembler {
    buffers: HashMap<String, Vec<u8>>,
    max_message_size: usize,
}

impl Reassembler {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            buffers: HashMap::new(),
            max_message_size,
        }
    }

    /// Appends a fragment. Returns the full message once `last` is set.
    ///
    /// A message growing past the size limit is discarded and reported as a
    /// protocol error; the next fragment from that peer starts a new buffer.
    pub fn push(&mut self, peer: &str, last: bool, chunk: &[u8]) -> SyncResult<Option<Vec<u8>>> {
        let buffer = self.buffers.entry(peer.to_string()).or_default();
        if buffer.len() + chunk.len() > self.max_message_size {
            let size = buffer.len() + chunk.len();
            self.buffers.remove(peer);
            return Err(SyncError::Protocol(format!(
                "message from {peer} exceeds {} bytes ({size})",
                self.max_message_size
            )));
        }
        buffer.extend_from_slice(chunk);
        if last {
            Ok(self.buffers.remove(peer))
        } else {
            Ok(None)
        }
    }

    /// Drops the partial message from `peer`, if any.
    pub fn purge(&mut self, peer: &str) -> bool {
        self.buffers.remove(peer).is_some()
    }

    /// Bytes buffered for `peer`, if a message is in progress.
    pub fn pending(&self, peer: &str) -> Option<usize> {
        self.buffers.get(peer).map(Vec::len)
    }

    /// Number of peers with a message in progress.
    pub fn in_progress(&self) -> usize {
        self.buffers.len()
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
    }
}
