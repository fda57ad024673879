//! UDP carrier over a tokio socket.
//!
//! The carrier owns the socket. Servers [`bind`](UdpCarrier::bind) and
//! answer through per-packet reply writers; clients
//! [`connect`](UdpCarrier::connect) and use [`Carrier::send`]. The receive
//! loop reads one datagram at a time, consults the loss model, parses the
//! header, and hands the body to the registered handler as a spawned task.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use rftp_core::wire::{Header, Message, MessageType};
use rftp_core::{Shutdown, MAX_DATAGRAM_SIZE};

use crate::carrier::{
    Carrier, CarrierError, Packet, PacketHandler, ReplySink, ReplyWriter,
};
use crate::loss::{LossModel, NoLoss};

/// Socket buffer size for high-throughput operation (2 MiB)
const SOCKET_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// Datagram carrier over one UDP socket
pub struct UdpCarrier {
    socket: Arc<UdpSocket>,
    peer: Option<SocketAddr>,
    handlers: Mutex<HashMap<MessageType, Arc<dyn PacketHandler>>>,
    loss: Mutex<Box<dyn LossModel>>,
    shutdown: Shutdown,
    tasks: Mutex<JoinSet<()>>,
}

impl UdpCarrier {
    /// Bind a listening carrier to `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`CarrierError::BindFailed`] when the socket cannot be
    /// created or bound.
    pub fn bind(addr: SocketAddr) -> Result<Self, CarrierError> {
        let socket = sized_socket(addr)?;
        Ok(Self::from_socket(socket, None))
    }

    /// Bind an ephemeral local port and direct the carrier at `host`.
    ///
    /// # Errors
    ///
    /// Returns [`CarrierError::BindFailed`] when `host` does not resolve
    /// or the socket cannot be set up.
    pub async fn connect(host: &str) -> Result<Self, CarrierError> {
        let peer = tokio::net::lookup_host(host)
            .await
            .map_err(|e| CarrierError::BindFailed(e.to_string()))?
            .next()
            .ok_or_else(|| CarrierError::BindFailed(format!("{host} does not resolve")))?;

        let local: SocketAddr = if peer.is_ipv4() {
            "0.0.0.0:0".parse().expect("static address")
        } else {
            "[::]:0".parse().expect("static address")
        };
        let socket = sized_socket(local)?;
        socket
            .connect(peer)
            .await
            .map_err(|e| CarrierError::BindFailed(e.to_string()))?;
        Ok(Self::from_socket(socket, Some(peer)))
    }

    fn from_socket(socket: UdpSocket, peer: Option<SocketAddr>) -> Self {
        Self {
            socket: Arc::new(socket),
            peer,
            handlers: Mutex::new(HashMap::new()),
            loss: Mutex::new(Box::new(NoLoss)),
            shutdown: Shutdown::new(),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Replace the loss model applied to received datagrams.
    pub fn set_loss_model(&self, model: Box<dyn LossModel>) {
        *self.loss.lock().unwrap() = model;
    }

    /// Local address the socket is bound to.
    ///
    /// # Errors
    ///
    /// Propagates the socket error.
    pub fn local_addr(&self) -> Result<SocketAddr, CarrierError> {
        Ok(self.socket.local_addr()?)
    }

    fn dispatch(&self, datagram: &[u8], remote: SocketAddr) {
        let (header, header_len) = match Header::parse(datagram) {
            Ok(parsed) => parsed,
            Err(error) => {
                debug!(%remote, %error, "dropping malformed datagram");
                return;
            }
        };

        let handler = self.handlers.lock().unwrap().get(&header.msg_type).cloned();
        let Some(handler) = handler else {
            debug!(%remote, msg_type = ?header.msg_type, "no handler registered, dropping");
            return;
        };

        let packet = Packet {
            ack_num: header.ack_num,
            options: header.options,
            data: Bytes::copy_from_slice(&datagram[header_len..]),
            remote,
        };
        let reply = ReplyWriter::new(Arc::new(UdpReply {
            socket: Arc::clone(&self.socket),
            peer: remote,
        }));

        let mut tasks = self.tasks.lock().unwrap();
        // reap finished handlers so the set does not grow unbounded
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move { handler.handle(reply, packet).await });
    }
}

#[async_trait]
impl Carrier for UdpCarrier {
    fn register(&self, msg_type: MessageType, handler: Arc<dyn PacketHandler>) {
        self.handlers.lock().unwrap().insert(msg_type, handler);
    }

    async fn run(&self) -> Result<(), CarrierError> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            tokio::select! {
                () = self.shutdown.wait() => return Ok(()),
                received = self.socket.recv_from(&mut buf) => {
                    let (len, remote) = match received {
                        Ok(received) => received,
                        Err(error) => {
                            if self.shutdown.is_triggered() {
                                return Ok(());
                            }
                            warn!(%error, "discarding datagram after socket error");
                            continue;
                        }
                    };

                    if self.loss.lock().unwrap().should_drop() {
                        debug!(%remote, "loss model dropped datagram");
                        continue;
                    }

                    self.dispatch(&buf[..len], remote);
                }
            }
        }
    }

    async fn send(&self, message: &Message) -> Result<(), CarrierError> {
        if self.shutdown.is_triggered() {
            return Err(CarrierError::Closed);
        }
        let peer = self.peer.ok_or(CarrierError::NotConnected)?;
        let datagram = message.encode()?;
        self.socket.send_to(&datagram, peer).await?;
        Ok(())
    }

    async fn close(&self, drain: Duration) -> Result<(), CarrierError> {
        if self.shutdown.is_triggered() {
            return Err(CarrierError::Closed);
        }
        self.shutdown.trigger();

        let mut tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        let drained = tokio::time::timeout(drain, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("timed out draining packet handlers on close");
        }
        Ok(())
    }
}

struct UdpReply {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

#[async_trait]
impl ReplySink for UdpReply {
    async fn send(&self, message: &Message) -> Result<(), CarrierError> {
        let datagram = message.encode()?;
        self.socket.send_to(&datagram, self.peer).await?;
        Ok(())
    }
}

fn sized_socket(addr: SocketAddr) -> Result<UdpSocket, CarrierError> {
    let domain = if addr.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    let socket = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))
        .map_err(|e| CarrierError::BindFailed(e.to_string()))?;
    socket
        .set_recv_buffer_size(SOCKET_BUFFER_SIZE)
        .map_err(|e| CarrierError::BindFailed(e.to_string()))?;
    socket
        .set_send_buffer_size(SOCKET_BUFFER_SIZE)
        .map_err(|e| CarrierError::BindFailed(e.to_string()))?;
    socket
        .bind(&addr.into())
        .map_err(|e| CarrierError::BindFailed(e.to_string()))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| CarrierError::BindFailed(e.to_string()))?;
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(|e| CarrierError::BindFailed(e.to_string()))
}
