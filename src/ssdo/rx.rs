//! SSDO receive channel, network to PCP to AP.
//!
//! The PCP accepts frames from the network into a FIFO and posts the oldest
//! one.  Once the AP acknowledges it, the frame moves out of the FIFO into
//! the "last acknowledged" snapshot.  The snapshot is reposted, under its
//! original channel sequence number, when the network asks for a
//! retransmission.  The AP acknowledges such a repost without delivering it
//! again.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::channel::{ChannelSeq, MSG_MAX_LEN, MsgFormat, Receiver, Sender};
use crate::config::{SSDO_FIFO_DEPTH, SSDO_MAX_PAYLOAD};
use crate::fifo::Fifo;
use crate::ssdo::SsdoHandler;
use crate::tbuf::{Tbuf, TbufIo};
use crate::timeout::{TimeoutHandle, TimeoutPool, TimeoutState};
use crate::{Error, Result};

// FIFO element: [network seq u8][reserved u8][len u16 LE][payload]
const ELEMENT_HEADER_LEN: usize = 4;
const ELEMENT_LEN: usize = ELEMENT_HEADER_LEN + SSDO_MAX_PAYLOAD;

/// SSDO frame delivered by the network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncomingFrame<'a> {
    /// Sequence number assigned by the sending node
    pub seq: u8,
    /// The sender asks for the frame with `seq` again
    pub retry: bool,
    pub payload: &'a [u8],
}

/// State of the PCP end of the receive channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    Invalid,
    WaitForFrame,
    WaitForAck,
    RepostFrame,
}

// What the buffer currently carries unacknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Nothing,
    Head(ChannelSeq),
    Acked,
}

/// PCP end of the receive channel
pub struct RxProducer<I: TbufIo> {
    sender: Sender<I>,
    state: RxState,
    fifo: Fifo<SSDO_FIFO_DEPTH, ELEMENT_LEN>,
    acked: [u8; ELEMENT_LEN],
    acked_seq: ChannelSeq,
    last_seq: Option<u8>,
    pending: Pending,
    repost_requested: bool,
    ack_timer: TimeoutHandle,
}

impl<I: TbufIo> RxProducer<I> {
    /// Arguments:
    /// - `tbuf` - producer end of the SSDO receive buffer
    /// - `channel` - channel number carried in every message
    /// - `pool` - pool the acknowledge timer is taken from
    /// - `ack_timeout` - sync cycles before an unacknowledged frame is
    ///   reposted
    pub fn new(
        tbuf: Tbuf<I>,
        channel: u8,
        pool: &mut TimeoutPool,
        ack_timeout: u32,
    ) -> Result<Self> {
        let sender = Sender::new(tbuf, channel)?;
        let fifo = Fifo::new(ELEMENT_LEN)?;
        let ack_timer = pool.create(ack_timeout)?;
        Ok(Self {
            sender,
            state: RxState::WaitForFrame,
            fifo,
            acked: [0; ELEMENT_LEN],
            acked_seq: ChannelSeq::INVALID,
            last_seq: None,
            pending: Pending::Nothing,
            repost_requested: false,
            ack_timer,
        })
    }

    pub fn state(&self) -> RxState {
        self.state
    }

    /// Frames accepted but not yet acknowledged by the AP
    pub fn queued(&self) -> usize {
        self.fifo.len()
    }

    /// Payload of the last frame the AP acknowledged
    pub fn last_acked(&self) -> Option<&[u8]> {
        self.acked_seq
            .is_valid()
            .then(|| element_payload(&self.acked))
    }

    /// Accept a frame from the network.
    ///
    /// Busy when the FIFO is full; the frame was not accepted and must be
    /// offered again.  A repeated sequence number without the retry flag is
    /// dropped.
    pub fn handle_incoming(&mut self, frame: &IncomingFrame<'_>) -> nb::Result<(), Error> {
        if frame.payload.len() > SSDO_MAX_PAYLOAD {
            return Err(nb::Error::Other(Error::PayloadTooLarge));
        }

        if frame.retry {
            if self.acked_seq.is_valid() && self.acked[0] == frame.seq {
                debug!("SSDO rx retransmission of seq {} requested", frame.seq);
                if self.state == RxState::WaitForFrame {
                    self.set_state(RxState::RepostFrame);
                } else {
                    self.repost_requested = true;
                }
            } else {
                trace!("SSDO rx retry of seq {} still queued", frame.seq);
            }
            return Ok(());
        }

        if self.last_seq == Some(frame.seq) {
            warn!("SSDO rx duplicate seq {} dropped", frame.seq);
            return Ok(());
        }

        let mut element = [0u8; ELEMENT_LEN];
        element[0] = frame.seq;
        element[2..4].copy_from_slice(&(frame.payload.len() as u16).to_le_bytes());
        element[ELEMENT_HEADER_LEN..ELEMENT_HEADER_LEN + frame.payload.len()]
            .copy_from_slice(frame.payload);
        match self.fifo.insert_element(&element) {
            Ok(()) => {
                self.last_seq = Some(frame.seq);
                Ok(())
            }
            Err(Error::FifoFull) => Err(nb::Error::WouldBlock),
            Err(e) => Err(nb::Error::Other(e)),
        }
    }

    /// Advance the state machine.  Busy while waiting for the AP.
    pub fn process(&mut self, pool: &mut TimeoutPool) -> nb::Result<(), Error> {
        match self.state {
            RxState::Invalid => Err(nb::Error::Other(Error::Uninit)),
            RxState::WaitForFrame => {
                if self.repost_requested {
                    self.repost_requested = false;
                    self.set_state(RxState::RepostFrame);
                    return Ok(self.repost(pool)?);
                }
                let Some(head) = self.fifo.peek() else {
                    return Ok(());
                };
                let seq = self
                    .sender
                    .post(MsgFormat::SsdoSet as u8, element_payload(head))?;
                self.pending = Pending::Head(seq);
                pool.start(self.ack_timer)?;
                self.set_state(RxState::WaitForAck);
                Ok(())
            }
            RxState::WaitForAck => {
                if self.sender.ready()? {
                    pool.stop(self.ack_timer)?;
                    if let Pending::Head(seq) = self.pending {
                        self.fifo.get_element(&mut self.acked)?;
                        self.acked_seq = seq;
                    }
                    self.pending = Pending::Nothing;
                    self.set_state(RxState::WaitForFrame);
                    return Ok(());
                }
                match pool.check_expire(self.ack_timer)? {
                    TimeoutState::Expired => {
                        warn!("SSDO rx acknowledge timeout");
                        self.set_state(RxState::RepostFrame);
                        Ok(self.repost(pool)?)
                    }
                    _ => Err(nb::Error::WouldBlock),
                }
            }
            RxState::RepostFrame => Ok(self.repost(pool)?),
        }
    }

    /// Count one synchronous cycle
    pub fn process_sync(&self, pool: &mut TimeoutPool) -> Result<()> {
        pool.increment(self.ack_timer)
    }

    // Write the unacknowledged head again, or the acknowledged snapshot if
    // nothing is pending
    fn repost(&mut self, pool: &mut TimeoutPool) -> Result<()> {
        let format = MsgFormat::SsdoSet as u8;
        match self.pending {
            Pending::Head(seq) => {
                let head = self.fifo.peek().ok_or(Error::FifoEmpty)?;
                self.sender.repost(seq, format, element_payload(head))?;
            }
            Pending::Nothing | Pending::Acked if self.acked_seq.is_valid() => {
                self.sender
                    .repost(self.acked_seq, format, element_payload(&self.acked))?;
                self.pending = Pending::Acked;
            }
            _ => {
                self.set_state(RxState::WaitForFrame);
                return Ok(());
            }
        }
        pool.start(self.ack_timer)?;
        self.set_state(RxState::WaitForAck);
        Ok(())
    }

    fn set_state(&mut self, state: RxState) {
        trace!("SSDO rx {:?} -> {state:?}", self.state);
        self.state = state;
    }
}

fn element_payload(element: &[u8]) -> &[u8] {
    let len = u16::from_le_bytes([element[2], element[3]]) as usize;
    &element[ELEMENT_HEADER_LEN..ELEMENT_HEADER_LEN + len.min(SSDO_MAX_PAYLOAD)]
}

/// AP end of the receive channel
pub struct RxConsumer<I: TbufIo> {
    receiver: Receiver<I>,
    scratch: [u8; MSG_MAX_LEN],
}

impl<I: TbufIo> RxConsumer<I> {
    pub fn new(tbuf: Tbuf<I>) -> Result<Self> {
        Ok(Self {
            receiver: Receiver::new(tbuf)?,
            scratch: [0; MSG_MAX_LEN],
        })
    }

    /// Deliver a fresh frame to `handler` and acknowledge it.
    ///
    /// Returns whether the handler was invoked.  Reposts are acknowledged
    /// without invoking it.
    pub fn process(&mut self, handler: &mut impl SsdoHandler) -> nb::Result<bool, Error> {
        let Some(msg) = self.receiver.poll(&mut self.scratch)? else {
            return Ok(false);
        };
        let delivered = !msg.duplicate;
        if delivered {
            handler.ssdo_received(msg.header.channel, msg.payload(&self.scratch));
        } else {
            debug!("SSDO rx repost of seq {} acknowledged", msg.header.seq.value());
        }
        self.receiver.acknowledge(&msg)?;
        Ok(delivered)
    }
}
