//! Message layer shared by the acyclic channels (SSDO, async, CC, logbook).
//!
//! Every triple buffer write carries a 6-byte header:
//!
//! | byte | field                                              |
//! |------|----------------------------------------------------|
//! | 0    | channel sequence number (bits 0..2), retry (bit 7) |
//! | 1    | message format                                     |
//! | 2    | channel number                                     |
//! | 3    | reserved                                           |
//! | 4..6 | payload length, little endian                      |
//!
//! The triple buffer sequence number signals freshness.  The channel
//! sequence number identifies the payload: a repost carries the same channel
//! sequence number and is acknowledged without being delivered again.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::config::ASYNC_MAX_PAYLOAD;
use crate::tbuf::{Tbuf, TbufIo, TbufRole, TbufSeq};
use crate::{Error, Result};

pub const HEADER_LEN: usize = 6;

/// Largest message (header and payload) any channel sends
pub const MSG_MAX_LEN: usize = HEADER_LEN + ASYNC_MAX_PAYLOAD;

/// Message formats of the SSDO and async channels
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgFormat {
    /// Safety process data (`MSG_FORMAT_SPDO_SET`)
    SpdoSet = 0x01,
    /// Safety service data and network management (`MSG_FORMAT_SSDO_SET`)
    SsdoSet = 0x02,
}

impl TryFrom<u8> for MsgFormat {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(MsgFormat::SpdoSet),
            0x02 => Ok(MsgFormat::SsdoSet),
            _ => Err(Error::Malformed),
        }
    }
}

const SEQ_MASK: u8 = 0x03;
const RETRY_FLAG: u8 = 0x80;

/// Two bit channel sequence number.  Cycles 1, 2, 3, 1, ... - 0 is invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelSeq(u8);

impl ChannelSeq {
    pub const INVALID: ChannelSeq = ChannelSeq(0);
    pub const FIRST: ChannelSeq = ChannelSeq(1);

    pub fn next(self) -> Self {
        match self.0 & SEQ_MASK {
            3 | 0 => ChannelSeq(1),
            value => ChannelSeq(value + 1),
        }
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl From<u8> for ChannelSeq {
    fn from(value: u8) -> Self {
        ChannelSeq(value & SEQ_MASK)
    }
}

/// Decoded message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    pub seq: ChannelSeq,
    /// Set on reposts and retransmission requests
    pub retry: bool,
    pub format: u8,
    pub channel: u8,
    pub len: u16,
}

impl MsgHeader {
    pub fn encode(&self, out: &mut [u8]) -> Result<()> {
        if out.len() < HEADER_LEN {
            return Err(Error::BufferTooSmall);
        }
        out[0] = (self.seq.0 & SEQ_MASK) | if self.retry { RETRY_FLAG } else { 0 };
        out[1] = self.format;
        out[2] = self.channel;
        out[3] = 0;
        out[4..6].copy_from_slice(&self.len.to_le_bytes());
        Ok(())
    }

    /// Decode a header and check the payload fits in `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::Malformed);
        }
        let header = MsgHeader {
            seq: ChannelSeq::from(buf[0]),
            retry: buf[0] & RETRY_FLAG != 0,
            format: buf[1],
            channel: buf[2],
            len: u16::from_le_bytes([buf[4], buf[5]]),
        };
        if !header.seq.is_valid() || HEADER_LEN + header.len as usize > buf.len() {
            return Err(Error::Malformed);
        }
        Ok(header)
    }
}

/// Message received by a [`Receiver`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Received {
    pub header: MsgHeader,
    /// Triple buffer sequence number to acknowledge
    pub tbuf_seq: TbufSeq,
    /// Same channel sequence number as the last acknowledged message
    pub duplicate: bool,
}

impl Received {
    /// Payload within the buffer passed to [`Receiver::poll()`]
    pub fn payload<'b>(&self, buf: &'b [u8]) -> &'b [u8] {
        &buf[HEADER_LEN..HEADER_LEN + self.header.len as usize]
    }
}

/// Producing end of a message channel
pub struct Sender<I: TbufIo> {
    tbuf: Tbuf<I>,
    channel: u8,
    next: ChannelSeq,
    scratch: [u8; MSG_MAX_LEN],
}

impl<I: TbufIo> Sender<I> {
    pub fn new(tbuf: Tbuf<I>, channel: u8) -> Result<Self> {
        if tbuf.role() != TbufRole::Producer {
            return Err(Error::InvalidOperation);
        }
        Ok(Self {
            tbuf,
            channel,
            next: ChannelSeq::FIRST,
            scratch: [0; MSG_MAX_LEN],
        })
    }

    /// Whether the consumer acknowledged the last message
    pub fn ready(&mut self) -> Result<bool> {
        self.tbuf.acknowledged()
    }

    /// Post a new message.  Busy while the previous one is unacknowledged.
    pub fn post(&mut self, format: u8, payload: &[u8]) -> nb::Result<ChannelSeq, Error> {
        if !self.ready()? {
            return Err(nb::Error::WouldBlock);
        }
        let seq = self.next;
        self.write(seq, false, format, payload)?;
        self.next = seq.next();
        Ok(seq)
    }

    /// Write `payload` again under an already used sequence number, whether or
    /// not the previous message was acknowledged.
    pub fn repost(&mut self, seq: ChannelSeq, format: u8, payload: &[u8]) -> Result<()> {
        self.write(seq, true, format, payload)
    }

    /// Sequence number the next [`Self::post()`] uses
    pub fn next_seq(&self) -> ChannelSeq {
        self.next
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Logical channel named in the header of the following posts
    pub fn set_channel(&mut self, channel: u8) {
        self.channel = channel;
    }

    pub fn tbuf_mut(&mut self) -> &mut Tbuf<I> {
        &mut self.tbuf
    }

    fn write(&mut self, seq: ChannelSeq, retry: bool, format: u8, payload: &[u8]) -> Result<()> {
        let total = HEADER_LEN + payload.len();
        if total > MSG_MAX_LEN || total > self.tbuf.slot_size() {
            return Err(Error::PayloadTooLarge);
        }
        let header = MsgHeader {
            seq,
            retry,
            format,
            channel: self.channel,
            len: payload.len() as u16,
        };
        header.encode(&mut self.scratch)?;
        self.scratch[HEADER_LEN..total].copy_from_slice(payload);
        let tbuf_seq = self.tbuf.write(&self.scratch[..total])?;
        trace!(
            "Channel {} posted seq {} (tbuf {tbuf_seq}) {} bytes",
            self.channel,
            seq.value(),
            payload.len()
        );
        Ok(())
    }
}

/// Consuming end of a message channel
pub struct Receiver<I: TbufIo> {
    tbuf: Tbuf<I>,
    delivered: ChannelSeq,
}

impl<I: TbufIo> Receiver<I> {
    pub fn new(tbuf: Tbuf<I>) -> Result<Self> {
        if tbuf.role() != TbufRole::Consumer {
            return Err(Error::InvalidOperation);
        }
        Ok(Self {
            tbuf,
            delivered: ChannelSeq::INVALID,
        })
    }

    /// Read a fresh message into `buf`.
    ///
    /// Returns `Ok(None)` when nothing new was published.  A malformed
    /// message is acknowledged, so the producer is not stuck on it, and
    /// reported as [`Error::Malformed`].
    pub fn poll(&mut self, buf: &mut [u8]) -> nb::Result<Option<Received>, Error> {
        if !self.tbuf.has_fresh()? {
            return Ok(None);
        }
        let snap = self.tbuf.read(buf)?;
        if !snap.fresh {
            return Ok(None);
        }
        let header = match MsgHeader::decode(&buf[..snap.len]) {
            Ok(header) => header,
            Err(e) => {
                warn!("Tbuf {:?} malformed message dropped", self.tbuf.id());
                self.tbuf.acknowledge(snap.seq)?;
                return Err(nb::Error::Other(e));
            }
        };
        Ok(Some(Received {
            header,
            tbuf_seq: snap.seq,
            duplicate: header.seq == self.delivered,
        }))
    }

    /// Acknowledge `msg` towards the producer and remember its channel
    /// sequence number.
    pub fn acknowledge(&mut self, msg: &Received) -> Result<()> {
        self.delivered = msg.header.seq;
        self.tbuf.acknowledge(msg.tbuf_seq)
    }

    /// Channel sequence number of the last acknowledged message
    pub fn delivered(&self) -> ChannelSeq {
        self.delivered
    }

    pub fn tbuf_mut(&mut self) -> &mut Tbuf<I> {
        &mut self.tbuf
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use core::sync::atomic::AtomicU32;

    use crate::config::{BufferId, TbufDescriptor};
    use crate::tbuf::{SliceTbufIo, Tbuf, TbufRole};

    pub const BASE: u32 = 0x4000;

    pub fn memory() -> std::boxed::Box<[AtomicU32]> {
        (0..512).map(|_| AtomicU32::new(0)).collect()
    }

    /// Producer and consumer ends of one buffer in `mem`
    pub fn tbuf_pair(
        mem: &[AtomicU32],
        id: BufferId,
        size: usize,
    ) -> (Tbuf<SliceTbufIo<'_>>, Tbuf<SliceTbufIo<'_>>) {
        let io = SliceTbufIo::new(mem, BASE);
        let desc = TbufDescriptor::new(id, BASE, size);
        let producer = Tbuf::create(io, TbufRole::Producer, &desc).unwrap();
        let consumer = Tbuf::attach(io, TbufRole::Consumer, &desc).unwrap();
        (producer, consumer)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::config::BufferId;

    #[test]
    fn seq_cycles_without_zero() {
        let mut seq = ChannelSeq::INVALID;
        let mut seen = [0u8; 6];
        for value in seen.iter_mut() {
            seq = seq.next();
            *value = seq.value();
        }
        assert_eq!(seen, [1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn header_encoding() {
        let header = MsgHeader {
            seq: ChannelSeq::from(2),
            retry: true,
            format: 0x02,
            channel: 7,
            len: 3,
        };
        let mut buf = [0u8; 9];
        header.encode(&mut buf).unwrap();
        assert_eq!(&buf[..HEADER_LEN], &[0x82, 0x02, 7, 0, 3, 0]);
        assert_eq!(MsgHeader::decode(&buf), Ok(header));
        // Declared payload longer than the buffer
        assert_eq!(MsgHeader::decode(&buf[..8]), Err(Error::Malformed));
    }

    #[test]
    fn post_waits_for_ack() {
        let mem = memory();
        let (producer, consumer) = tbuf_pair(&mem, BufferId::AsyncRx, 32);
        let mut sender = Sender::new(producer, 1).unwrap();
        let mut receiver = Receiver::new(consumer).unwrap();

        assert_eq!(sender.post(0, b"one"), Ok(ChannelSeq::FIRST));
        assert_eq!(sender.post(0, b"two"), Err(nb::Error::WouldBlock));

        let mut buf = [0u8; 32];
        let msg = receiver.poll(&mut buf).unwrap().unwrap();
        assert!(!msg.duplicate);
        assert_eq!(msg.payload(&buf), b"one");
        // Nothing fresh until the producer writes again
        assert_eq!(receiver.poll(&mut buf), Ok(None));
        receiver.acknowledge(&msg).unwrap();

        assert_eq!(sender.post(0, b"two"), Ok(ChannelSeq::from(2)));
    }

    #[test]
    fn repost_is_duplicate() {
        let mem = memory();
        let (producer, consumer) = tbuf_pair(&mem, BufferId::SsdoRx, 32);
        let mut sender = Sender::new(producer, 0).unwrap();
        let mut receiver = Receiver::new(consumer).unwrap();
        let mut buf = [0u8; 32];

        let seq = sender.post(2, b"frame").unwrap();
        let msg = receiver.poll(&mut buf).unwrap().unwrap();
        receiver.acknowledge(&msg).unwrap();

        sender.repost(seq, 2, b"frame").unwrap();
        let again = receiver.poll(&mut buf).unwrap().unwrap();
        assert!(again.duplicate);
        assert!(again.header.retry);
        assert_eq!(again.payload(&buf), b"frame");
    }

    #[test]
    fn oversized_payload_rejected() {
        let mem = memory();
        let (producer, _consumer) = tbuf_pair(&mem, BufferId::SsdoTx, 8);
        let mut sender = Sender::new(producer, 0).unwrap();
        assert_eq!(
            sender.post(0, b"too long"),
            Err(nb::Error::Other(Error::PayloadTooLarge))
        );
        // Nothing was consumed from the sequence
        assert_eq!(sender.next_seq(), ChannelSeq::FIRST);
    }
}
