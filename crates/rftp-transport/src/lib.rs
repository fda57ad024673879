//! # RFTP Transport
//!
//! Datagram carriers for the RFTP protocol.
//!
//! This crate provides:
//! - The [`Carrier`] trait: handler registration, a receive loop, and
//!   serialized sends over one owned socket
//! - [`UdpCarrier`], the production carrier over a tokio UDP socket
//! - [`MemoryCarrier`], a queue-backed test double with the same contract
//! - The stochastic [`loss`] models applied on the receive path

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod carrier;
pub mod loss;
pub mod memory;
pub mod udp;

pub use carrier::{Carrier, CarrierError, HandlerFn, Packet, PacketHandler, ReplyWriter};
pub use loss::{LossError, LossModel, MarkovLoss, NoLoss};
pub use memory::{MemoryCarrier, MemoryEndpoint};
pub use udp::UdpCarrier;
