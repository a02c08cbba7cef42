//! Configuration channel, AP to PCP.
//!
//! Carries one small object dictionary write per message:
//! `[index u16 LE][subindex u8][size u8][data, up to 8 bytes]`.
//!
//! The AP queues writes in a [`Fifo`] and posts the next one each time the
//! PCP acknowledged the previous.  The PCP accepts only objects on its
//! linking list and forwards them to the [`ObjectDictionary`].

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use heapless::Vec;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::channel::{HEADER_LEN, MSG_MAX_LEN, Receiver, Sender};
use crate::config::{CC_FIFO_DEPTH, CC_MAX_LINKS};
use crate::fifo::Fifo;
use crate::od::ObjectDictionary;
use crate::tbuf::{Tbuf, TbufIo};
use crate::{Error, Result};

/// Largest object value carried
pub const CC_MAX_DATA: usize = 8;

/// Encoded object length
pub const CC_OBJECT_LEN: usize = 4 + CC_MAX_DATA;

/// Channel header format byte of configuration messages
pub const CC_FORMAT: u8 = 0x10;

/// Configuration object as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CcObject {
    pub index: u16,
    pub subindex: u8,
    pub data: Vec<u8, CC_MAX_DATA>,
}

impl CcObject {
    pub fn new(index: u16, subindex: u8, data: &[u8]) -> Result<Self> {
        let data = Vec::from_slice(data).map_err(|_| Error::PayloadTooLarge)?;
        Ok(Self {
            index,
            subindex,
            data,
        })
    }

    /// Fixed length encoding, unused data bytes are zero
    pub fn encode(&self) -> [u8; CC_OBJECT_LEN] {
        let mut buf = [0u8; CC_OBJECT_LEN];
        buf[0..2].copy_from_slice(&self.index.to_le_bytes());
        buf[2] = self.subindex;
        buf[3] = self.data.len() as u8;
        buf[4..4 + self.data.len()].copy_from_slice(&self.data);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            return Err(Error::Malformed);
        }
        let size = buf[3] as usize;
        if size > CC_MAX_DATA || buf.len() < 4 + size {
            return Err(Error::Malformed);
        }
        Self::new(u16::from_le_bytes([buf[0], buf[1]]), buf[2], &buf[4..4 + size])
    }
}

/// Entry of the configuration channel linking list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CcLink {
    pub index: u16,
    pub subindex: u8,
    pub size: u8,
}

/// AP end of the configuration channel
pub struct CcProducer<I: TbufIo> {
    sender: Sender<I>,
    queue: Fifo<CC_FIFO_DEPTH, CC_OBJECT_LEN>,
}

impl<I: TbufIo> CcProducer<I> {
    pub fn new(tbuf: Tbuf<I>) -> Result<Self> {
        if tbuf.slot_size() < HEADER_LEN + CC_OBJECT_LEN {
            return Err(Error::InvalidSize(tbuf.id()));
        }
        Ok(Self {
            sender: Sender::new(tbuf, 0)?,
            queue: Fifo::new(CC_OBJECT_LEN)?,
        })
    }

    /// Queue a write of `data` to object `index`/`subindex`.
    ///
    /// Busy while the queue is full.
    pub fn write_object(&mut self, index: u16, subindex: u8, data: &[u8]) -> nb::Result<(), Error> {
        let object = CcObject::new(index, subindex, data)?;
        match self.queue.insert_element(&object.encode()) {
            Ok(()) => Ok(()),
            Err(Error::FifoFull) => Err(nb::Error::WouldBlock),
            Err(e) => Err(nb::Error::Other(e)),
        }
    }

    /// Post the oldest queued object once the previous one was acknowledged.
    pub fn process_async(&mut self) -> nb::Result<(), Error> {
        let Some(element) = self.queue.peek() else {
            return Ok(());
        };
        let mut object = [0u8; CC_OBJECT_LEN];
        object.copy_from_slice(element);
        self.sender.post(CC_FORMAT, &object)?;
        self.queue.discard()?;
        trace!("CC posted {:#06X}", u16::from_le_bytes([object[0], object[1]]));
        Ok(())
    }

    /// Objects waiting to be posted
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

/// PCP end of the configuration channel
pub struct CcConsumer<I: TbufIo> {
    receiver: Receiver<I>,
    links: Vec<CcLink, CC_MAX_LINKS>,
    scratch: [u8; MSG_MAX_LEN],
}

impl<I: TbufIo> CcConsumer<I> {
    pub fn new(tbuf: Tbuf<I>) -> Result<Self> {
        Ok(Self {
            receiver: Receiver::new(tbuf)?,
            links: Vec::new(),
            scratch: [0; MSG_MAX_LEN],
        })
    }

    /// Resolve the linking list against the object dictionary.  Every object
    /// must exist with exactly the listed size.
    pub fn link_objects(&mut self, od: &impl ObjectDictionary, links: &[CcLink]) -> Result<()> {
        self.links.clear();
        for link in links {
            let size = od.object_size(link.index, link.subindex);
            if link.size as usize > CC_MAX_DATA || size != Some(link.size as usize) {
                error!(
                    "CC link {:#06X}/{} size {} does not match dictionary {size:?}",
                    link.index, link.subindex, link.size
                );
                return Err(Error::LinkMismatch {
                    index: link.index,
                    subindex: link.subindex,
                });
            }
            self.links.push(*link).map_err(|_| Error::PoolExhausted)?;
        }
        debug!("CC linked {} objects", self.links.len());
        Ok(())
    }

    /// Apply a freshly received object to the dictionary.
    ///
    /// Returns the object written, `None` if nothing new arrived.  Rejected
    /// objects are still acknowledged so the AP can post the next one.
    pub fn process_async(&mut self, od: &mut impl ObjectDictionary) -> nb::Result<Option<CcObject>, Error> {
        let Some(msg) = self.receiver.poll(&mut self.scratch)? else {
            return Ok(None);
        };
        self.receiver.acknowledge(&msg)?;
        if msg.duplicate {
            trace!("CC duplicate seq {} ignored", msg.header.seq.value());
            return Ok(None);
        }

        let object = CcObject::decode(msg.payload(&self.scratch))?;
        let linked = self.links.iter().any(|link| {
            link.index == object.index
                && link.subindex == object.subindex
                && link.size as usize == object.data.len()
        });
        if !linked {
            warn!("CC object {:#06X}/{} not linked", object.index, object.subindex);
            return Err(nb::Error::Other(Error::UnlinkedObject {
                index: object.index,
                subindex: object.subindex,
            }));
        }
        od.write(object.index, object.subindex, &object.data)
            .map_err(Error::Abort)?;
        Ok(Some(object))
    }
}
