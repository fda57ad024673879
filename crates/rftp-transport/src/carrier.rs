//! Carrier abstraction: one owned socket, per-kind packet handlers.
//!
//! A carrier reads datagrams, applies the loss model, parses the header,
//! and dispatches the body to the handler registered for its message type
//! together with a reply writer bound to the sender's address. Outbound
//! messages are serialized through [`Carrier::send`].

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use rftp_core::wire::{Message, MessageType, WireOption};
use rftp_core::WireError;

/// Carrier-level errors
#[derive(Debug, Error)]
pub enum CarrierError {
    /// I/O error from the underlying socket
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    /// Message could not be serialized
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Binding or resolving the local address failed
    #[error("failed to bind: {0}")]
    BindFailed(String),

    /// `send` called on a carrier with no connected peer
    #[error("carrier has no connected peer")]
    NotConnected,

    /// Carrier was closed
    #[error("carrier is closed")]
    Closed,
}

/// One received datagram, header already parsed
#[derive(Debug, Clone)]
pub struct Packet {
    /// Ack number from the header; 0 means "not set"
    pub ack_num: u8,
    /// Header options (unknown ones are preserved here, readers skip them)
    pub options: Vec<WireOption>,
    /// Message body after the header
    pub data: Bytes,
    /// Address the datagram came from
    pub remote: SocketAddr,
}

/// Sends messages back to the peer a packet came from.
#[async_trait]
pub trait ReplySink: Send + Sync {
    /// Serialize and transmit one message to the bound peer.
    async fn send(&self, message: &Message) -> Result<(), CarrierError>;
}

/// Cloneable handle over a [`ReplySink`]
#[derive(Clone)]
pub struct ReplyWriter {
    sink: Arc<dyn ReplySink>,
}

impl ReplyWriter {
    /// Wrap a sink.
    pub fn new(sink: Arc<dyn ReplySink>) -> Self {
        Self { sink }
    }

    /// Serialize and transmit one message to the bound peer.
    ///
    /// # Errors
    ///
    /// Propagates serialization and socket errors.
    pub async fn send(&self, message: &Message) -> Result<(), CarrierError> {
        self.sink.send(message).await
    }
}

impl std::fmt::Debug for ReplyWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyWriter").finish_non_exhaustive()
    }
}

/// Handles all packets of one message type
#[async_trait]
pub trait PacketHandler: Send + Sync {
    /// Process one packet. Runs as its own task; blocking here does not
    /// stall the receive loop.
    async fn handle(&self, reply: ReplyWriter, packet: Packet);
}

/// Adapter turning an async closure into a [`PacketHandler`]
pub struct HandlerFn<F>(pub F);

#[async_trait]
impl<F, Fut> PacketHandler for HandlerFn<F>
where
    F: Fn(ReplyWriter, Packet) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn handle(&self, reply: ReplyWriter, packet: Packet) {
        (self.0)(reply, packet).await;
    }
}

/// One owned datagram socket with per-message-type dispatch
#[async_trait]
pub trait Carrier: Send + Sync {
    /// Register the handler for one message type. Datagrams of a type
    /// with no handler are dropped.
    fn register(&self, msg_type: MessageType, handler: Arc<dyn PacketHandler>);

    /// Run the receive loop until the carrier is closed.
    ///
    /// # Errors
    ///
    /// Returns socket errors that are not part of an intentional close.
    async fn run(&self) -> Result<(), CarrierError>;

    /// Serialize and send one message to the connected peer.
    ///
    /// # Errors
    ///
    /// Returns [`CarrierError::NotConnected`] when the carrier only
    /// listens, and serialization or socket errors otherwise.
    async fn send(&self, message: &Message) -> Result<(), CarrierError>;

    /// Stop the receive loop and wait up to `drain` for in-flight
    /// handlers to finish.
    ///
    /// # Errors
    ///
    /// Returns [`CarrierError::Closed`] when called twice.
    async fn close(&self, drain: Duration) -> Result<(), CarrierError>;
}
