//! Process data images (RPDO and TPDO).
//!
//! A PDO buffer carries one flat image per synchronous cycle.  The linking
//! table maps objects to byte ranges inside the image:
//!
//! | field      | type  |
//! |------------|-------|
//! | `index`    | `u16` |
//! | `subindex` | `u8`  |
//! | `offset`   | `u16` |
//! | `size`     | `u16` |
//!
//! The table is resolved once at configuration time.  Data is copied twice
//! per cycle: between the object dictionary (or application) and a local
//! image, and between the local image and the triple buffer.  The producer
//! only publishes an image explicitly marked complete with
//! [`PdoProducer::proc_finished()`].
//!
//! RPDOs are produced by the PCP and consumed by the AP, TPDOs the other way
//! around.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use heapless::Vec;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::config::{PDO_MAX_IMAGE, PDO_MAX_LINKS};
use crate::od::ObjectDictionary;
use crate::tbuf::{Tbuf, TbufIo, TbufRole};
use crate::{Error, Result};

/// Linking table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdoLink {
    pub index: u16,
    pub subindex: u8,
    /// Byte offset inside the image
    pub offset: u16,
    pub size: u16,
}

impl PdoLink {
    pub const fn new(index: u16, subindex: u8, offset: u16, size: u16) -> Self {
        Self {
            index,
            subindex,
            offset,
            size,
        }
    }

    fn range(&self) -> core::ops::Range<usize> {
        self.offset as usize..self.offset as usize + self.size as usize
    }
}

/// Validate a linking table against the object dictionary and an image of
/// `image_size` bytes.
///
/// Fails on the first entry naming a missing object, a size different from
/// the dictionary's, or a range outside the image.
pub fn link_pdos(
    od: &impl ObjectDictionary,
    links: &[PdoLink],
    image_size: usize,
) -> Result<Vec<PdoLink, PDO_MAX_LINKS>> {
    let mut linked = Vec::new();
    for link in links {
        let size = od.object_size(link.index, link.subindex);
        let fits = link.range().end <= image_size;
        if size != Some(link.size as usize) || !fits {
            error!(
                "PDO link {:#06X}/{} offset {} size {} invalid: dictionary {size:?} image {image_size}",
                link.index, link.subindex, link.offset, link.size
            );
            return Err(Error::LinkMismatch {
                index: link.index,
                subindex: link.subindex,
            });
        }
        linked.push(*link).map_err(|_| Error::PoolExhausted)?;
    }
    Ok(linked)
}

// Local image plus the resolved table, shared by both directions
struct Image {
    links: Vec<PdoLink, PDO_MAX_LINKS>,
    data: [u8; PDO_MAX_IMAGE],
    size: usize,
}

impl Image {
    fn new<I: TbufIo>(tbuf: &Tbuf<I>) -> Result<Self> {
        let size = tbuf.slot_size();
        if size > PDO_MAX_IMAGE {
            return Err(Error::InvalidSize(tbuf.id()));
        }
        Ok(Self {
            links: Vec::new(),
            data: [0; PDO_MAX_IMAGE],
            size,
        })
    }

    fn link(&mut self, od: &impl ObjectDictionary, links: &[PdoLink]) -> Result<()> {
        self.links = link_pdos(od, links, self.size)?;
        Ok(())
    }

    fn find(&self, index: u16, subindex: u8) -> Result<PdoLink> {
        self.links
            .iter()
            .find(|link| link.index == index && link.subindex == subindex)
            .copied()
            .ok_or(Error::UnlinkedObject { index, subindex })
    }

    fn bytes(&self) -> &[u8] {
        &self.data[..self.size]
    }
}

/// Producing end of a PDO buffer
pub struct PdoProducer<I: TbufIo> {
    tbuf: Tbuf<I>,
    image: Image,
    finished: bool,
}

impl<I: TbufIo> PdoProducer<I> {
    pub fn new(tbuf: Tbuf<I>) -> Result<Self> {
        if tbuf.role() != TbufRole::Producer {
            return Err(Error::InvalidOperation);
        }
        let image = Image::new(&tbuf)?;
        Ok(Self {
            tbuf,
            image,
            finished: false,
        })
    }

    pub fn link(&mut self, od: &impl ObjectDictionary, links: &[PdoLink]) -> Result<()> {
        self.image.link(od, links)?;
        debug!(
            "{:?} linked {} objects into {} byte image",
            self.tbuf.id(),
            self.image.links.len(),
            self.image.size
        );
        Ok(())
    }

    /// Set one linked object in the local image
    pub fn set_object(&mut self, index: u16, subindex: u8, data: &[u8]) -> Result<()> {
        let link = self.image.find(index, subindex)?;
        if data.len() != link.size as usize {
            return Err(Error::PayloadTooLarge);
        }
        self.image.data[link.range()].copy_from_slice(data);
        Ok(())
    }

    /// Fill the local image from the object dictionary
    pub fn copy_from(&mut self, od: &impl ObjectDictionary) -> Result<()> {
        for link in self.image.links.iter() {
            od.read(link.index, link.subindex, &mut self.image.data[link.range()])
                .map_err(Error::Abort)?;
        }
        Ok(())
    }

    /// Mark the local image complete for this cycle
    pub fn proc_finished(&mut self) {
        self.finished = true;
    }

    /// Publish the image if it was marked complete.  Returns whether it was
    /// published.
    pub fn process_sync(&mut self) -> Result<bool> {
        if !self.finished {
            return Ok(false);
        }
        self.tbuf.write(self.image.bytes())?;
        self.finished = false;
        Ok(true)
    }

    pub fn image(&self) -> &[u8] {
        self.image.bytes()
    }
}

/// Consuming end of a PDO buffer
pub struct PdoConsumer<I: TbufIo> {
    tbuf: Tbuf<I>,
    image: Image,
    scratch: [u8; PDO_MAX_IMAGE],
}

impl<I: TbufIo> PdoConsumer<I> {
    pub fn new(tbuf: Tbuf<I>) -> Result<Self> {
        if tbuf.role() != TbufRole::Consumer {
            return Err(Error::InvalidOperation);
        }
        let image = Image::new(&tbuf)?;
        Ok(Self {
            tbuf,
            image,
            scratch: [0; PDO_MAX_IMAGE],
        })
    }

    pub fn link(&mut self, od: &impl ObjectDictionary, links: &[PdoLink]) -> Result<()> {
        self.image.link(od, links)?;
        debug!(
            "{:?} linked {} objects from {} byte image",
            self.tbuf.id(),
            self.image.links.len(),
            self.image.size
        );
        Ok(())
    }

    /// Copy a fresh image into the local one.  Returns whether it changed.
    ///
    /// The slot is read into a scratch buffer first, so a torn read leaves
    /// the previous image untouched.
    pub fn process_sync(&mut self) -> nb::Result<bool, Error> {
        let size = self.image.size;
        let snap = self.tbuf.read(&mut self.scratch[..size])?;
        if snap.fresh {
            self.image.data[..snap.len].copy_from_slice(&self.scratch[..snap.len]);
        }
        Ok(snap.fresh)
    }

    /// Current value of one linked object
    pub fn object(&self, index: u16, subindex: u8) -> Result<&[u8]> {
        let link = self.image.find(index, subindex)?;
        Ok(&self.image.data[link.range()])
    }

    /// Write every linked object to the object dictionary
    pub fn copy_to(&self, od: &mut impl ObjectDictionary) -> Result<()> {
        for link in self.image.links.iter() {
            od.write(link.index, link.subindex, &self.image.data[link.range()])
                .map_err(Error::Abort)?;
        }
        Ok(())
    }

    pub fn image(&self) -> &[u8] {
        self.image.bytes()
    }
}
