//! Static configuration - buffer layout table and compile time limits.
//!
//! The descriptor table is the contract between both processors and must be
//! identical on the PCP and the AP.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use crate::tbuf::TbufRole;
use crate::{Error, Result};

/// Maximum number of timeout instances in a [`crate::timeout::TimeoutPool`]
pub const TIMEOUT_MAX_INSTANCES: usize = 10;

/// Number of received SSDO frames the PCP can hold before reporting busy
pub const SSDO_FIFO_DEPTH: usize = 4;

/// Maximum SSDO frame payload, excluding the channel header
pub const SSDO_MAX_PAYLOAD: usize = 256;

/// Maximum data bytes in one xcom subframe
pub const XCOM_MAX_DATA: usize = 254;

/// Maximum async message payload, excluding the channel header.  Holds the
/// largest full xcom message: message header plus two CRC16 subframes.
pub const ASYNC_MAX_PAYLOAD: usize = 12 + 2 * (5 + XCOM_MAX_DATA + 2);

/// Maximum PDO image size in bytes
pub const PDO_MAX_IMAGE: usize = 512;

/// Maximum number of entries in a PDO linking table
pub const PDO_MAX_LINKS: usize = 32;

/// Number of configuration objects the AP can queue
pub const CC_FIFO_DEPTH: usize = 8;

/// Maximum number of entries in the configuration channel linking list
pub const CC_MAX_LINKS: usize = 16;

/// Maximum number of async channels routed by one receiver
pub const ASYNC_MAX_CHANNELS: usize = 4;

/// Sync cycles the PCP waits for the AP to acknowledge an SSDO frame before
/// reposting it
pub const SSDO_ACK_TIMEOUT_CYCLES: u32 = 50;

/// Sync cycles between two retries of an unresolved SSDO peer address
pub const SSDO_ARP_RETRY_CYCLES: u32 = 10;

/// Unresolved address retries before the SSDO frame is dropped
pub const SSDO_ARP_RETRY_MAX: u8 = 3;

/// Sync cycles a logbook record may stay unacknowledged before reporting a
/// stuck consumer
pub const LOGBOOK_TIMEOUT_CYCLES: u32 = 100;

/// Processor on each side of the interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processor {
    /// Communication processor running the fieldbus stack
    Pcp,
    /// Application processor running the user logic
    Ap,
}

/// Identifies a buffer in the descriptor table
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferId {
    Status = 0,
    Cc = 1,
    Rpdo = 2,
    Tpdo = 3,
    SsdoTx = 4,
    SsdoRx = 5,
    AsyncTx = 6,
    AsyncRx = 7,
    Logbook = 8,
}

impl BufferId {
    pub const ALL: [BufferId; 9] = [
        BufferId::Status,
        BufferId::Cc,
        BufferId::Rpdo,
        BufferId::Tpdo,
        BufferId::SsdoTx,
        BufferId::SsdoRx,
        BufferId::AsyncTx,
        BufferId::AsyncRx,
        BufferId::Logbook,
    ];

    /// Processor which produces into this buffer
    pub fn producer(&self) -> Processor {
        match self {
            BufferId::Status | BufferId::Rpdo | BufferId::SsdoRx | BufferId::AsyncRx => {
                Processor::Pcp
            }
            BufferId::Cc
            | BufferId::Tpdo
            | BufferId::SsdoTx
            | BufferId::AsyncTx
            | BufferId::Logbook => Processor::Ap,
        }
    }

    /// Role `side` takes on this buffer
    pub fn role_for(&self, side: Processor) -> TbufRole {
        if self.producer() == side {
            TbufRole::Producer
        } else {
            TbufRole::Consumer
        }
    }
}

impl TryFrom<u8> for BufferId {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        BufferId::ALL
            .iter()
            .copied()
            .find(|id| *id as u8 == value)
            .ok_or(Error::Malformed)
    }
}

/// One entry of the buffer layout table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TbufDescriptor {
    pub id: BufferId,
    /// Base address of the buffer region, word aligned
    pub base_addr: u32,
    /// Payload bytes per slot
    pub size: usize,
}

impl TbufDescriptor {
    pub const fn new(id: BufferId, base_addr: u32, size: usize) -> Self {
        Self {
            id,
            base_addr,
            size,
        }
    }

    /// Bytes occupied by this buffer, including control block and slots
    pub const fn region_size(&self) -> usize {
        crate::tbuf::region_size(self.size)
    }
}

/// Configuration handed to [`crate::psi::Psi::init`] and
/// [`crate::pcp::Pcp::init`]
#[derive(Debug, Clone, Copy)]
pub struct PsiConfig<'a> {
    /// Buffer layout table
    pub buffers: &'a [TbufDescriptor],
    /// SSDO channel number carried in the channel header
    pub ssdo_channel: u8,
    /// Async channel number the local async sender posts on
    pub async_channel: u8,
    /// Sync cycles before an unacknowledged SSDO frame is reposted
    pub ssdo_ack_timeout: u32,
    /// Sync cycles between unresolved SSDO peer address retries
    pub arp_retry_cycles: u32,
    /// Sync cycles before a stuck logbook consumer is reported
    pub logbook_timeout: u32,
}

impl<'a> PsiConfig<'a> {
    pub const fn new(buffers: &'a [TbufDescriptor]) -> Self {
        Self {
            buffers,
            ssdo_channel: 0,
            async_channel: 0,
            ssdo_ack_timeout: SSDO_ACK_TIMEOUT_CYCLES,
            arp_retry_cycles: SSDO_ARP_RETRY_CYCLES,
            logbook_timeout: LOGBOOK_TIMEOUT_CYCLES,
        }
    }

    /// Look up the descriptor for `id`.  A buffer listed twice is a
    /// configuration error.
    pub fn descriptor(&self, id: BufferId) -> Result<Option<TbufDescriptor>> {
        let mut found = None;
        for desc in self.buffers.iter().filter(|d| d.id == id) {
            if found.is_some() {
                return Err(Error::DuplicateBuffer(id));
            }
            found = Some(*desc);
        }
        Ok(found)
    }

    /// Like [`Self::descriptor()`], but the buffer must be present.
    pub fn required(&self, id: BufferId) -> Result<TbufDescriptor> {
        self.descriptor(id)?.ok_or(Error::MissingBuffer(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_are_mirrored() {
        for id in BufferId::ALL {
            assert_ne!(id.role_for(Processor::Pcp), id.role_for(Processor::Ap));
        }
        assert_eq!(BufferId::Rpdo.role_for(Processor::Pcp), TbufRole::Producer);
        assert_eq!(BufferId::Tpdo.role_for(Processor::Pcp), TbufRole::Consumer);
    }

    #[test]
    fn duplicate_descriptor_rejected() {
        let table = [
            TbufDescriptor::new(BufferId::Status, 0x100, 16),
            TbufDescriptor::new(BufferId::Status, 0x200, 16),
        ];
        let config = PsiConfig::new(&table);
        assert_eq!(
            config.descriptor(BufferId::Status),
            Err(Error::DuplicateBuffer(BufferId::Status))
        );
        assert_eq!(
            config.required(BufferId::Rpdo),
            Err(Error::MissingBuffer(BufferId::Rpdo))
        );
    }

    #[test]
    fn buffer_id_from_u8() {
        assert_eq!(BufferId::try_from(5), Ok(BufferId::SsdoRx));
        assert_eq!(BufferId::try_from(42), Err(Error::Malformed));
    }
}
