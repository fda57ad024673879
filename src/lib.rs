//! # RFTP
//!
//! Reliable file transfer protocol over unreliable datagrams.
//!
//! A client requests files from a server by name; the server streams
//! their contents back as fixed-size chunks; the client reassembles them
//! in order, verifies an MD5 checksum, and writes them to local sinks.
//! The transport copes with packet loss, reordering, variable round-trip
//! time, and a slow receiver.
//!
//! This crate is a facade over the workspace members:
//!
//! - [`rftp_core`]: wire codec, chunk ordering, AIMD rate control
//! - [`rftp_transport`]: datagram carriers and loss simulation
//! - [`rftp_client`]: ordered reassembly and request orchestration
//! - [`rftp_server`]: per-peer send sessions and demultiplexing
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rftp::{Client, FileRequest, UdpCarrier};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let carrier = Arc::new(UdpCarrier::connect("files.example.org:2020").await?);
//! let client = Client::new(carrier);
//! let sink = Box::new(tokio::fs::File::create("notes.txt").await?);
//! let outcomes = client.request(vec![FileRequest::new("notes.txt", sink)]).await?;
//! assert!(outcomes[0].error.is_none());
//! # Ok(())
//! # }
//! ```

pub use rftp_client::{
    Client, ClientConfig, ClientError, FileOutcome, FileRequest, FileSink, TransferError,
};
pub use rftp_core::{
    wire, ChunkQueue, RateController, Shutdown, WireError, CHUNK_SIZE, MAX_DATAGRAM_SIZE,
    MAX_WIRE_OFFSET,
};
pub use rftp_server::{
    DirectorySource, FileSource, MemorySource, Server, ServerConfig, ServerError,
};
pub use rftp_transport::{
    Carrier, CarrierError, LossModel, MarkovLoss, MemoryCarrier, NoLoss, UdpCarrier,
};
