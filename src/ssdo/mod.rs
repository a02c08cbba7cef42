//! Safety service data (SSDO) channels.
//!
//! Two directions, each split over both processors:
//! - [`tx`] - AP posts frames, the PCP hands them to the network transport.
//!   Handing off may stall while the peer's address is being resolved, which
//!   is retried on a cycle counted timer.
//! - [`rx`] - the PCP queues frames arriving from the network and posts them
//!   to the AP one at a time.  The last acknowledged frame is kept so a
//!   retransmission request can be answered without involving the
//!   application again.
//!
//! Every message is an [`MsgFormat::SsdoSet`] message on the channel layer.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

pub mod rx;
pub mod tx;

pub use rx::{IncomingFrame, RxConsumer, RxProducer, RxState};
pub use tx::{TxConsumer, TxProducer, TxState};

use crate::Result;
pub use crate::channel::MsgFormat;

/// Outcome of handing a frame to the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handoff {
    /// Frame queued, the transport calls back once it was sent
    Queued,
    /// Peer address unknown, resolution started.  Retry later.
    AddressPending,
}

/// Network transport collaborator on the PCP
pub trait SsdoTransport {
    /// Start transmitting `payload` on `channel`.  Must not block.
    fn transmit(&mut self, channel: u8, payload: &[u8]) -> Result<Handoff>;
}

/// Receive handler collaborator on the AP
pub trait SsdoHandler {
    /// Called exactly once per frame received from the network
    fn ssdo_received(&mut self, channel: u8, payload: &[u8]);
}
