//! # RFTP Core
//!
//! Protocol engine building blocks for RFTP, a reliable file transfer
//! protocol over unreliable datagrams.
//!
//! This crate provides:
//! - Wire encoding and decoding of the five protocol message kinds
//! - A chunk priority queue for out-of-order reassembly
//! - The AIMD rate controller gating the sender
//! - An idempotent shutdown signal shared by protocol tasks
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Client / Server sessions                    │
//! │   (reassembly, rescheduling, rate-gated writing)                │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                        Datagram carrier                         │
//! │   (socket ownership, handler dispatch, loss simulation)         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                          Wire codec                             │
//! │   (big-endian framing, seven-byte offsets, options)             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod congestion;
pub mod error;
pub mod queue;
pub mod shutdown;
pub mod wire;

pub use congestion::RateController;
pub use error::WireError;
pub use queue::ChunkQueue;
pub use shutdown::Shutdown;
pub use wire::{
    Ack, Close, FileDescriptor, FileStatus, Header, Message, MessageType, Metadata, Payload,
    Request, ResendEntry,
};

/// Protocol version carried in the high nibble of the first header byte
pub const PROTOCOL_VERSION: u8 = 0;

/// Payload bytes per chunk; only the last chunk of a file may be shorter
pub const CHUNK_SIZE: usize = 1024;

/// Upper bound on a single datagram, header included
pub const MAX_DATAGRAM_SIZE: usize = 2048;

/// Largest file offset representable in the seven-byte wire encoding
pub const MAX_WIRE_OFFSET: u64 = (1 << 56) - 1;

/// Number of chunks a file of `size` bytes occupies.
#[must_use]
pub fn chunk_count(size: u64) -> u64 {
    size.div_ceil(CHUNK_SIZE as u64)
}

/// Length of the final chunk of a file of `size` bytes.
#[must_use]
pub fn last_chunk_len(size: u64) -> usize {
    match size % CHUNK_SIZE as u64 {
        0 if size > 0 => CHUNK_SIZE,
        rem => rem as usize,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_count_boundaries() {
        assert_eq!(chunk_count(0), 0);
        assert_eq!(chunk_count(1), 1);
        assert_eq!(chunk_count(1024), 1);
        assert_eq!(chunk_count(1025), 2);
        assert_eq!(chunk_count(102_400), 100);
    }

    #[test]
    fn last_chunk_len_boundaries() {
        assert_eq!(last_chunk_len(0), 0);
        assert_eq!(last_chunk_len(10), 10);
        assert_eq!(last_chunk_len(1024), 1024);
        assert_eq!(last_chunk_len(1025), 1);
        assert_eq!(last_chunk_len(102_400), 1024);
    }
}
