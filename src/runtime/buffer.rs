//! Per-session transfer buffers.
//!
//! Allocated once when the parameters are negotiated, before any data
//! stream is admitted:
//! - `scratch`: receive buffer shared by every reading stream. Contents are
//!   never inspected, so one buffer serves all of them.
//! - `payload`: read-only block the sending streams write from. Each stream
//!   holds its own cursor into the same allocation.

use crate::protocol::DEFAULT_BLOCK_LEN;
use bytes::Bytes;

pub struct TransferBuffers {
    scratch: Vec<u8>,
    payload: Bytes,
}

impl TransferBuffers {
    /// Allocate both buffers with `len` bytes each.
    pub fn new(len: usize) -> Self {
        Self {
            scratch: vec![0u8; len],
            payload: Bytes::from(vec![0u8; len]),
        }
    }

    /// Size of each buffer.
    pub fn len(&self) -> usize {
        self.scratch.len()
    }

    /// Receive buffer for the stream currently being serviced.
    pub fn scratch_mut(&mut self) -> &mut [u8] {
        &mut self.scratch
    }

    /// A private cursor over the shared payload. No bytes are copied.
    pub fn payload(&self) -> Bytes {
        self.payload.clone()
    }
}

impl Default for TransferBuffers {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_LEN)
    }
}
