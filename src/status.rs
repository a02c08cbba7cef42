//! Status channel, PCP to AP, published every synchronous cycle.
//!
//! Record layout (16 bytes, little endian):
//! `[timestamp u64][sync counter u32][state u8][reserved 3]`

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::tbuf::{Tbuf, TbufIo, TbufRole};
use crate::{Error, Result};

pub const STATUS_RECORD_LEN: usize = 16;

/// Status record carried by the status buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusRecord {
    /// Network time of the cycle start
    pub timestamp: u64,
    /// Synchronous cycles since the PCP started
    pub sync_counter: u32,
    /// Protocol stack state
    pub state: u8,
}

impl StatusRecord {
    pub fn encode(&self) -> [u8; STATUS_RECORD_LEN] {
        let mut buf = [0u8; STATUS_RECORD_LEN];
        buf[0..8].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[8..12].copy_from_slice(&self.sync_counter.to_le_bytes());
        buf[12] = self.state;
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < STATUS_RECORD_LEN {
            return Err(Error::Malformed);
        }
        let mut timestamp = [0u8; 8];
        timestamp.copy_from_slice(&buf[0..8]);
        let mut counter = [0u8; 4];
        counter.copy_from_slice(&buf[8..12]);
        Ok(Self {
            timestamp: u64::from_le_bytes(timestamp),
            sync_counter: u32::from_le_bytes(counter),
            state: buf[12],
        })
    }
}

/// PCP end of the status channel
pub struct StatusProducer<I: TbufIo> {
    tbuf: Tbuf<I>,
    record: StatusRecord,
}

impl<I: TbufIo> StatusProducer<I> {
    pub fn new(tbuf: Tbuf<I>) -> Result<Self> {
        if tbuf.role() != TbufRole::Producer {
            return Err(Error::InvalidOperation);
        }
        if tbuf.slot_size() < STATUS_RECORD_LEN {
            return Err(Error::InvalidSize(tbuf.id()));
        }
        Ok(Self {
            tbuf,
            record: StatusRecord::default(),
        })
    }

    /// Set the stack state published from the next cycle on
    pub fn set_state(&mut self, state: u8) {
        self.record.state = state;
    }

    /// Publish the record for this cycle.  The consumer never acknowledges
    /// status, so this always overwrites.
    pub fn process_sync(&mut self, timestamp: u64) -> Result<()> {
        self.record.timestamp = timestamp;
        self.record.sync_counter = self.record.sync_counter.wrapping_add(1);
        self.tbuf.write(&self.record.encode())?;
        Ok(())
    }

    pub fn record(&self) -> &StatusRecord {
        &self.record
    }
}

/// AP end of the status channel
pub struct StatusConsumer<I: TbufIo> {
    tbuf: Tbuf<I>,
    record: StatusRecord,
}

impl<I: TbufIo> StatusConsumer<I> {
    pub fn new(tbuf: Tbuf<I>) -> Result<Self> {
        if tbuf.role() != TbufRole::Consumer {
            return Err(Error::InvalidOperation);
        }
        if tbuf.slot_size() < STATUS_RECORD_LEN {
            return Err(Error::InvalidSize(tbuf.id()));
        }
        Ok(Self {
            tbuf,
            record: StatusRecord::default(),
        })
    }

    /// Refresh the local copy.  Returns whether a new record arrived; on a
    /// torn read the previous record is kept.
    pub fn process_sync(&mut self) -> nb::Result<bool, Error> {
        let mut buf = [0u8; STATUS_RECORD_LEN];
        let snap = self.tbuf.read(&mut buf)?;
        if !snap.fresh {
            return Ok(false);
        }
        self.record = StatusRecord::decode(&buf[..snap.len])?;
        Ok(true)
    }

    pub fn timestamp(&self) -> u64 {
        self.record.timestamp
    }

    pub fn sync_counter(&self) -> u32 {
        self.record.sync_counter
    }

    pub fn state(&self) -> u8 {
        self.record.state
    }
}
