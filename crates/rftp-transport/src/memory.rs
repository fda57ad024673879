//! In-memory carrier for protocol tests.
//!
//! Fulfills the [`Carrier`] contract from queues instead of a socket:
//! the test injects raw datagrams toward the application and observes
//! every message the application sends, already decoded.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::debug;

use rftp_core::wire::{Header, Message, MessageType};
use rftp_core::Shutdown;

use crate::carrier::{Carrier, CarrierError, Packet, PacketHandler, ReplySink, ReplyWriter};

/// Queue depth of the injected and observed message channels
const QUEUE_DEPTH: usize = 256;

/// Fixed fake peer address packets appear to come from
#[must_use]
pub fn test_remote() -> SocketAddr {
    "10.0.0.1:1000".parse().expect("static address")
}

/// Test half of a [`MemoryCarrier`]
pub struct MemoryEndpoint {
    /// Inject raw datagrams as if they had arrived from the network
    pub to_carrier: mpsc::Sender<Vec<u8>>,
    /// Observe every message the application side sent
    pub from_carrier: mpsc::Receiver<Message>,
}

impl MemoryEndpoint {
    /// Encode and inject one message toward the application.
    ///
    /// # Errors
    ///
    /// Returns [`CarrierError::Closed`] when the carrier is gone and
    /// serialization errors from the codec.
    pub async fn inject(&self, message: &Message) -> Result<(), CarrierError> {
        let datagram = message.encode()?;
        self.to_carrier
            .send(datagram)
            .await
            .map_err(|_| CarrierError::Closed)
    }
}

/// Queue-backed carrier with the same contract as the UDP one
pub struct MemoryCarrier {
    handlers: Mutex<HashMap<MessageType, Arc<dyn PacketHandler>>>,
    inbound: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    outbound: mpsc::Sender<Message>,
    shutdown: Shutdown,
    tasks: Mutex<JoinSet<()>>,
}

impl MemoryCarrier {
    /// Create a carrier and the endpoint a test drives it with.
    #[must_use]
    pub fn new() -> (Arc<Self>, MemoryEndpoint) {
        let (to_carrier, inbound) = mpsc::channel(QUEUE_DEPTH);
        let (outbound, from_carrier) = mpsc::channel(QUEUE_DEPTH);
        (
            Arc::new(Self {
                handlers: Mutex::new(HashMap::new()),
                inbound: tokio::sync::Mutex::new(inbound),
                outbound,
                shutdown: Shutdown::new(),
                tasks: Mutex::new(JoinSet::new()),
            }),
            MemoryEndpoint {
                to_carrier,
                from_carrier,
            },
        )
    }

    fn dispatch(&self, datagram: &[u8]) {
        let (header, header_len) = match Header::parse(datagram) {
            Ok(parsed) => parsed,
            Err(error) => {
                debug!(%error, "dropping malformed datagram");
                return;
            }
        };
        let handler = self.handlers.lock().unwrap().get(&header.msg_type).cloned();
        let Some(handler) = handler else {
            debug!(msg_type = ?header.msg_type, "no handler registered, dropping");
            return;
        };

        let packet = Packet {
            ack_num: header.ack_num,
            options: header.options,
            data: Bytes::copy_from_slice(&datagram[header_len..]),
            remote: test_remote(),
        };
        let reply = ReplyWriter::new(Arc::new(MemoryReply {
            outbound: self.outbound.clone(),
        }));

        let mut tasks = self.tasks.lock().unwrap();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move { handler.handle(reply, packet).await });
    }
}

#[async_trait]
impl Carrier for MemoryCarrier {
    fn register(&self, msg_type: MessageType, handler: Arc<dyn PacketHandler>) {
        self.handlers.lock().unwrap().insert(msg_type, handler);
    }

    async fn run(&self) -> Result<(), CarrierError> {
        let mut inbound = self.inbound.lock().await;
        loop {
            tokio::select! {
                () = self.shutdown.wait() => return Ok(()),
                datagram = inbound.recv() => {
                    let Some(datagram) = datagram else { return Ok(()) };
                    self.dispatch(&datagram);
                }
            }
        }
    }

    async fn send(&self, message: &Message) -> Result<(), CarrierError> {
        if self.shutdown.is_triggered() {
            return Err(CarrierError::Closed);
        }
        // exercise the codec exactly like the socket path would
        let decoded = Message::decode(&message.encode()?)?;
        self.outbound
            .send(decoded)
            .await
            .map_err(|_| CarrierError::Closed)
    }

    async fn close(&self, drain: Duration) -> Result<(), CarrierError> {
        if self.shutdown.is_triggered() {
            return Err(CarrierError::Closed);
        }
        self.shutdown.trigger();
        let mut tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        let _ = tokio::time::timeout(drain, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        Ok(())
    }
}

struct MemoryReply {
    outbound: mpsc::Sender<Message>,
}

#[async_trait]
impl ReplySink for MemoryReply {
    async fn send(&self, message: &Message) -> Result<(), CarrierError> {
        let decoded = Message::decode(&message.encode()?)?;
        self.outbound
            .send(decoded)
            .await
            .map_err(|_| CarrierError::Closed)
    }
}
