//! # RFTP Server
//!
//! Send side of the RFTP protocol: a per-peer session that reads the
//! requested files, streams chunks subject to AIMD rate control, caches
//! everything it sent for retransmission, and reschedules resends from
//! incoming ACKs; plus the orchestrator that demultiplexes datagrams to
//! sessions and evicts idle ones.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod server;
pub mod session;
pub mod source;

pub use server::{Server, ServerConfig, ServerError};
pub use session::{Session, SessionConfig};
pub use source::{
    DirectorySource, FileAccessError, FileSlice, FileSource, MemorySource, SliceReader,
};
