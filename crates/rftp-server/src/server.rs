//! Server orchestrator: demultiplexes datagrams to per-peer sessions.
//!
//! REQUEST creates a session keyed on the peer address unless one already
//! exists; ACKs route to the session's inbound queue; CLOSE tears the
//! session down. Idle sessions evict themselves through their cleaner.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info};

use rftp_core::wire::{Ack, Close, MessageType, Request};
use rftp_transport::{Carrier, CarrierError, HandlerFn, Packet};

use crate::session::{Session, SessionConfig};
use crate::source::FileSource;

/// Server-level errors
#[derive(Debug, Error)]
pub enum ServerError {
    /// Transport failure
    #[error(transparent)]
    Carrier(#[from] CarrierError),
}

/// Per-session tuning applied to every accepted peer
pub type ServerConfig = SessionConfig;

/// RFTP server over one listening carrier
pub struct Server {
    carrier: Arc<dyn Carrier>,
    source: Arc<dyn FileSource>,
    sessions: Arc<DashMap<SocketAddr, Session>>,
    config: ServerConfig,
}

impl Server {
    /// Create a server with default session tuning.
    pub fn new(carrier: Arc<dyn Carrier>, source: Arc<dyn FileSource>) -> Self {
        Self::with_config(carrier, source, ServerConfig::default())
    }

    /// Create a server with explicit session tuning.
    pub fn with_config(
        carrier: Arc<dyn Carrier>,
        source: Arc<dyn FileSource>,
        config: ServerConfig,
    ) -> Self {
        Self {
            carrier,
            source,
            sessions: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Register the protocol handlers and run the carrier until it is
    /// closed.
    ///
    /// # Errors
    ///
    /// Propagates carrier failures.
    pub async fn listen(&self) -> Result<(), ServerError> {
        self.register_handlers();
        self.carrier.run().await?;
        Ok(())
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Close every session and the carrier.
    ///
    /// # Errors
    ///
    /// Propagates carrier close failures.
    pub async fn shutdown(&self, drain: Duration) -> Result<(), ServerError> {
        for entry in self.sessions.iter() {
            entry.value().close();
        }
        self.sessions.clear();
        self.carrier.close(drain).await?;
        Ok(())
    }

    fn register_handlers(&self) {
        let sessions = Arc::clone(&self.sessions);
        let source = Arc::clone(&self.source);
        let config = self.config.clone();
        self.carrier.register(
            MessageType::Request,
            Arc::new(HandlerFn(move |reply, packet: Packet| {
                let sessions = Arc::clone(&sessions);
                let source = Arc::clone(&source);
                let config = config.clone();
                async move {
                    let request = match Request::decode(&packet.data) {
                        Ok(request) => request,
                        Err(error) => {
                            debug!(peer = %packet.remote, %error, "dropping malformed request");
                            return;
                        }
                    };
                    match sessions.entry(packet.remote) {
                        dashmap::mapref::entry::Entry::Occupied(_) => {
                            debug!(peer = %packet.remote, "duplicate request ignored");
                        }
                        dashmap::mapref::entry::Entry::Vacant(slot) => {
                            info!(
                                peer = %packet.remote,
                                files = request.files.len(),
                                "accepting new session"
                            );
                            let session = Session::spawn(
                                packet.remote,
                                request,
                                source,
                                reply,
                                Arc::clone(&sessions),
                                config,
                            );
                            slot.insert(session);
                        }
                    }
                }
            })),
        );

        let sessions = Arc::clone(&self.sessions);
        self.carrier.register(
            MessageType::Ack,
            Arc::new(HandlerFn(move |_reply, packet: Packet| {
                let sessions = Arc::clone(&sessions);
                async move {
                    let mut ack = match Ack::decode(&packet.data) {
                        Ok(ack) => ack,
                        Err(error) => {
                            debug!(peer = %packet.remote, %error, "dropping malformed ack");
                            return;
                        }
                    };
                    ack.ack_number = packet.ack_num;
                    // take the sender out of the map before awaiting
                    let sender = sessions
                        .get(&packet.remote)
                        .map(|session| session.ack_sender());
                    match sender {
                        Some(sender) => {
                            let _ = sender.send(ack).await;
                        }
                        None => debug!(peer = %packet.remote, "ack from unknown peer dropped"),
                    }
                }
            })),
        );

        let sessions = Arc::clone(&self.sessions);
        self.carrier.register(
            MessageType::Close,
            Arc::new(HandlerFn(move |_reply, packet: Packet| {
                let sessions = Arc::clone(&sessions);
                async move {
                    match Close::decode(&packet.data) {
                        Ok(close) => {
                            info!(peer = %packet.remote, reason = close.reason, "peer closed")
                        }
                        Err(error) => debug!(peer = %packet.remote, %error, "malformed close"),
                    }
                    if let Some((_, session)) = sessions.remove(&packet.remote) {
                        session.close();
                    }
                }
            })),
        );
    }
}
