//! Logbook channel, AP to PCP.
//!
//! One fixed format record per message:
//! `[level u8][source u8][code u16 LE][info u32 LE]`.
//!
//! A record is never overwritten before the PCP acknowledged it.  If the PCP
//! stops acknowledging, the producer reports [`Error::Timeout`] once per
//! timeout period and keeps the record in place.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::channel::{HEADER_LEN, MSG_MAX_LEN, Receiver, Sender};
use crate::tbuf::{Tbuf, TbufIo};
use crate::timeout::{TimeoutHandle, TimeoutPool, TimeoutState};
use crate::{Error, Result};

/// Encoded record length
pub const LOG_ENTRY_LEN: usize = 8;

/// Channel header format byte of logbook messages
pub const LOGBOOK_FORMAT: u8 = 0x20;

/// Logbook record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEntry {
    pub level: u8,
    /// Module the entry originates from
    pub source: u8,
    pub code: u16,
    /// Additional information, meaning depends on `code`
    pub info: u32,
}

impl LogEntry {
    pub fn encode(&self) -> [u8; LOG_ENTRY_LEN] {
        let mut buf = [0u8; LOG_ENTRY_LEN];
        buf[0] = self.level;
        buf[1] = self.source;
        buf[2..4].copy_from_slice(&self.code.to_le_bytes());
        buf[4..8].copy_from_slice(&self.info.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != LOG_ENTRY_LEN {
            return Err(Error::Malformed);
        }
        Ok(Self {
            level: buf[0],
            source: buf[1],
            code: u16::from_le_bytes([buf[2], buf[3]]),
            info: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }
}

/// Logbook collaborator on the PCP
pub trait LogHandler {
    fn log_entry(&mut self, entry: &LogEntry);
}

/// AP end of the logbook channel
pub struct LogbookProducer<I: TbufIo> {
    sender: Sender<I>,
    timer: TimeoutHandle,
}

impl<I: TbufIo> LogbookProducer<I> {
    pub fn new(tbuf: Tbuf<I>, pool: &mut TimeoutPool, timeout: u32) -> Result<Self> {
        if tbuf.slot_size() < HEADER_LEN + LOG_ENTRY_LEN {
            return Err(Error::InvalidSize(tbuf.id()));
        }
        let sender = Sender::new(tbuf, 0)?;
        let timer = pool.create(timeout)?;
        Ok(Self { sender, timer })
    }

    /// Post a record.  Busy while the previous one is unacknowledged.
    pub fn post_log_entry(
        &mut self,
        pool: &mut TimeoutPool,
        entry: &LogEntry,
    ) -> nb::Result<(), Error> {
        self.sender.post(LOGBOOK_FORMAT, &entry.encode())?;
        pool.start(self.timer)?;
        Ok(())
    }

    /// Count one synchronous cycle while a record is unacknowledged.
    ///
    /// Fails with [`Error::Timeout`] each time the timeout elapses without
    /// an acknowledge.
    pub fn process_sync(&mut self, pool: &mut TimeoutPool) -> Result<()> {
        if pool.check_expire(self.timer)? == TimeoutState::Stopped {
            return Ok(());
        }
        if self.sender.ready()? {
            return pool.stop(self.timer);
        }
        pool.increment(self.timer)?;
        if pool.check_expire(self.timer)? == TimeoutState::Expired {
            warn!("Logbook record not acknowledged");
            pool.start(self.timer)?;
            return Err(Error::Timeout);
        }
        Ok(())
    }

    pub fn ready(&mut self) -> Result<bool> {
        self.sender.ready()
    }
}

/// PCP end of the logbook channel
pub struct LogbookConsumer<I: TbufIo> {
    receiver: Receiver<I>,
    scratch: [u8; MSG_MAX_LEN],
}

impl<I: TbufIo> LogbookConsumer<I> {
    pub fn new(tbuf: Tbuf<I>) -> Result<Self> {
        Ok(Self {
            receiver: Receiver::new(tbuf)?,
            scratch: [0; MSG_MAX_LEN],
        })
    }

    /// Hand a fresh record to `handler` and acknowledge it.
    pub fn process(&mut self, handler: &mut impl LogHandler) -> nb::Result<bool, Error> {
        let Some(msg) = self.receiver.poll(&mut self.scratch)? else {
            return Ok(false);
        };
        let entry = if msg.duplicate {
            None
        } else {
            Some(LogEntry::decode(msg.payload(&self.scratch)))
        };
        self.receiver.acknowledge(&msg)?;
        match entry {
            Some(entry) => {
                handler.log_entry(&entry?);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
