//! Triple buffer shared between the PCP and the AP.
//!
//! A buffer consists of a control block followed by three identical slots.
//! Exactly one processor produces into a buffer and the other consumes from
//! it, fixed at configuration time.
//!
//! Layout (all words little endian):
//!
//! | offset | word        | meaning                                            |
//! |--------|-------------|----------------------------------------------------|
//! | 0      | `slot_size` | payload bytes per slot, 0 until initialised         |
//! | 4      | `producer`  | latest sequence number (bits 0..8), slot (8..16)   |
//! | 8      | `consumer`  | acknowledged sequence number (0..8), read slot (8..16) |
//! | 12     | `flags`     | reserved                                           |
//! | 16     | slots       | 3 x (`begin` stamp, `len`, data, `end` stamp)      |
//!
//! See [`crate`] for a description of the protocol.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[cfg(feature = "async")]
pub mod futures;
pub mod sync;

#[cfg(feature = "async")]
pub use futures::{AsyncTbuf, AsyncTbufIo, BridgeTbufIo};
pub use sync::{RamTbuf, RamTbufIo, SliceTbufIo, Tbuf, TbufIo};

use crate::{Error, Result};

/// Number of slots in a triple buffer
pub const SLOT_COUNT: u32 = 3;

/// Slot index meaning "the consumer is not reading any slot"
pub const NO_SLOT: u32 = 0xFF;

/// Whether the user of this buffer is the Producer or the Consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TbufRole {
    Producer,
    Consumer,
}

/// Control block at the start of every triple buffer
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TbufCb {
    /// Payload bytes per slot.  0 while the buffer is uninitialised.
    pub slot_size: u32,

    /// Latest published sequence number and the slot holding it
    pub producer: u32,

    /// Acknowledge register - acknowledged sequence number and the slot the
    /// consumer is reading
    pub consumer: u32,

    /// Currently unused
    pub flags: u32,
}

/// TbufCb offsets
impl TbufCb {
    pub const fn slot_size_offset() -> u32 {
        core::mem::offset_of!(TbufCb, slot_size) as u32
    }

    pub const fn producer_offset() -> u32 {
        core::mem::offset_of!(TbufCb, producer) as u32
    }

    pub const fn consumer_offset() -> u32 {
        core::mem::offset_of!(TbufCb, consumer) as u32
    }

    pub const fn flags_offset() -> u32 {
        core::mem::offset_of!(TbufCb, flags) as u32
    }

    pub const fn slots_offset() -> u32 {
        core::mem::size_of::<Self>() as u32
    }
}

/// Per-slot framing: `begin` stamp, `len` word, data, `end` stamp.
pub(crate) const SLOT_OVERHEAD: u32 = 12;
pub(crate) const SLOT_BEGIN_OFFSET: u32 = 0;
pub(crate) const SLOT_LEN_OFFSET: u32 = 4;
pub(crate) const SLOT_DATA_OFFSET: u32 = 8;

/// Bytes occupied by a buffer with `slot_size` payload bytes per slot
pub const fn region_size(slot_size: usize) -> usize {
    TbufCb::slots_offset() as usize + SLOT_COUNT as usize * slot_stride(slot_size)
}

pub(crate) const fn slot_stride(slot_size: usize) -> usize {
    SLOT_OVERHEAD as usize + slot_size.next_multiple_of(4)
}

pub(crate) fn slot_addr(base_addr: u32, slot_size: usize, slot: u32) -> u32 {
    base_addr + TbufCb::slots_offset() + slot * slot_stride(slot_size) as u32
}

/// Sequence number published with every write.  0 means nothing has been
/// published yet.
pub type TbufSeq = u8;

/// Successor of `seq`, skipping the "never published" value
pub fn next_seq(seq: TbufSeq) -> TbufSeq {
    match seq.wrapping_add(1) {
        0 => 1,
        next => next,
    }
}

/// `true` if `seq` is a published sequence number other than `last_seen`.
///
/// A consumer only ever reads the latest slot, so any change is fresh no
/// matter how many writes it missed.
pub fn seq_is_fresh(seq: TbufSeq, last_seen: TbufSeq) -> bool {
    seq != 0 && seq != last_seen
}

/// Result of a consumer read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    /// Sequence number of the slot read
    pub seq: TbufSeq,
    /// Payload bytes copied
    pub len: usize,
    /// Whether this sequence number was not observed before
    pub fresh: bool,
}

impl Snapshot {
    pub(crate) const EMPTY: Snapshot = Snapshot {
        seq: 0,
        len: 0,
        fresh: false,
    };
}

pub(crate) fn pack(seq: TbufSeq, slot: u32) -> u32 {
    ((slot & 0xFF) << 8) | seq as u32
}

pub(crate) fn unpack(word: u32) -> (TbufSeq, u32) {
    ((word & 0xFF) as u8, (word >> 8) & 0xFF)
}

/// Slot the producer may write: neither the latest nor the one being read.
pub(crate) fn free_slot(latest: u32, reading: u32) -> u32 {
    (0..SLOT_COUNT)
        .find(|slot| *slot != latest && *slot != reading)
        .unwrap_or(0)
}

/// Claim attempts before a consumer read gives up for this cycle
pub(crate) const CLAIM_ATTEMPTS: usize = 3;

// Helper functions

fn check_base_addr(addr: u32) -> Result<()> {
    if addr % 4 != 0 {
        Err(Error::NotAligned)
    } else {
        Ok(())
    }
}

fn check_slot_size(size: usize) -> Result<()> {
    if size == 0 || size > u16::MAX as usize {
        Err(Error::BufferTooSmall)
    } else {
        Ok(())
    }
}

fn consumer_only(role: TbufRole) -> Result<()> {
    if role != TbufRole::Consumer {
        Err(Error::InvalidOperation)
    } else {
        Ok(())
    }
}

fn producer_only(role: TbufRole) -> Result<()> {
    if role != TbufRole::Producer {
        Err(Error::InvalidOperation)
    } else {
        Ok(())
    }
}
