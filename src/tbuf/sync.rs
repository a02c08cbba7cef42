//! Synchronous triple buffer - used by both processors on a shared memory.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use core::sync::atomic::{AtomicU32, Ordering};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::config::{BufferId, TbufDescriptor};
use crate::tbuf::{CLAIM_ATTEMPTS, NO_SLOT, SLOT_COUNT, Snapshot, TbufCb, TbufRole, TbufSeq};
use crate::tbuf::{SLOT_BEGIN_OFFSET, SLOT_DATA_OFFSET, SLOT_LEN_OFFSET};
use crate::tbuf::{check_base_addr, check_slot_size, consumer_only, producer_only};
use crate::tbuf::{free_slot, next_seq, pack, seq_is_fresh, slot_addr, unpack};
use crate::{Error, Result};

// Words moved per bulk access
const BULK_WORDS: usize = 8;

/// Trait for accessing a triple buffer in a shared medium (usually RAM).
///
/// Sync version, typically used for direct RAM access.
pub trait TbufIo {
    /// Atomic read u32 operation
    fn read_u32(&mut self, addr: u32) -> Result<u32>;

    /// Atomic write u32 operation
    fn write_u32(&mut self, addr: u32, value: u32) -> Result<()>;

    /// Bulk read access, no need for atomicity
    fn read_bulk(&mut self, addr: u32, buf: &mut [u32]) -> Result<()>;

    /// Bulk write access, no need for atomicity
    fn write_bulk(&mut self, addr: u32, data: &[u32]) -> Result<()>;
}

/// Triple buffer instance, owned by one producer or one consumer.
pub struct Tbuf<I: TbufIo> {
    io: I,
    id: BufferId,
    role: TbufRole,
    base_addr: u32,
    slot_size: usize,
    // Consumer state
    last_seen: TbufSeq,
    reading: u32,
}

impl<I: TbufIo> Tbuf<I> {
    /// Initialise a new buffer.  Used by the processor owning the memory
    /// (the PCP) before the other side attaches.
    ///
    /// Arguments:
    /// - `io` - Object implementing [`TbufIo`] trait to access shared medium
    /// - `role` - Whether the user is the Producer or the Consumer
    /// - `desc` - Buffer id, base address and payload size per slot
    pub fn create(io: I, role: TbufRole, desc: &TbufDescriptor) -> Result<Self> {
        check_base_addr(desc.base_addr)?;
        check_slot_size(desc.size).map_err(|_| Error::InvalidSize(desc.id))?;

        let mut tbuf = Self::from_parts(io, role, desc);

        // Buffer is only valid once the slot size is non-zero.
        tbuf.write_slot_size(0)?;

        tbuf.write_producer(pack(0, 0))?;
        tbuf.write_consumer(pack(0, NO_SLOT))?;
        tbuf.write_cb(TbufCb::flags_offset(), 0)?;
        for slot in 0..SLOT_COUNT {
            let addr = tbuf.slot_addr(slot);
            tbuf.io.write_u32(addr + SLOT_BEGIN_OFFSET, 0)?;
            tbuf.io.write_u32(addr + SLOT_LEN_OFFSET, 0)?;
            let end = tbuf.slot_end_offset();
            tbuf.io.write_u32(addr + end, 0)?;
        }

        // Final step is to set the slot size
        tbuf.write_slot_size(desc.size)?;

        debug!(
            "Created tbuf {:?} {role:?} at {:#010X} slot size {} bytes",
            desc.id, desc.base_addr, desc.size
        );

        Ok(tbuf)
    }

    /// Attach to a buffer initialised by the other processor.
    ///
    /// Fails with [`Error::Uninit`] until the owner has created it, and with
    /// [`Error::InvalidSize`] if both sides disagree on the layout.
    pub fn attach(io: I, role: TbufRole, desc: &TbufDescriptor) -> Result<Self> {
        check_base_addr(desc.base_addr)?;
        check_slot_size(desc.size).map_err(|_| Error::InvalidSize(desc.id))?;

        let mut tbuf = Self::from_parts(io, role, desc);

        let slot_size = tbuf.read_cb(TbufCb::slot_size_offset())? as usize;
        if slot_size == 0 {
            return Err(Error::Uninit);
        }
        if slot_size != desc.size {
            error!(
                "Tbuf {:?} size mismatch: configured {} found {slot_size}",
                desc.id, desc.size
            );
            return Err(Error::InvalidSize(desc.id));
        }

        debug!(
            "Attached tbuf {:?} {role:?} at {:#010X} slot size {slot_size} bytes",
            desc.id, desc.base_addr
        );

        Ok(tbuf)
    }

    /// Producer: copy `payload` into the free slot and publish it.
    ///
    /// Returns the published sequence number.
    pub fn write(&mut self, payload: &[u8]) -> Result<TbufSeq> {
        producer_only(self.role)?;

        if payload.len() > self.slot_size {
            return Err(Error::PayloadTooLarge);
        }

        let (seq, latest) = unpack(self.read_producer()?);
        let (_, reading) = unpack(self.read_consumer()?);
        let slot = free_slot(latest, reading);
        let seq = next_seq(seq);
        let addr = self.slot_addr(slot);

        // Begin stamp first, end stamp last
        self.io.write_u32(addr + SLOT_BEGIN_OFFSET, seq as u32)?;
        self.io
            .write_u32(addr + SLOT_LEN_OFFSET, payload.len() as u32)?;
        self.write_bytes(addr + SLOT_DATA_OFFSET, payload)?;
        let end = self.slot_end_offset();
        self.io.write_u32(addr + end, seq as u32)?;

        // Atomically publish by writing the producer word last
        self.write_producer(pack(seq, slot))?;

        trace!("Tbuf {:?} published seq {seq} in slot {slot}", self.id);

        Ok(seq)
    }

    /// Consumer: copy the most recently published slot into `buf`.
    ///
    /// Never blocks.  A read torn by a concurrent write returns
    /// [`nb::Error::WouldBlock`] and is retried on a later cycle.
    pub fn read(&mut self, buf: &mut [u8]) -> nb::Result<Snapshot, Error> {
        consumer_only(self.role)?;

        let (seq, slot) = self.claim_latest()?;
        if seq == 0 {
            return Ok(Snapshot::EMPTY);
        }

        let addr = self.slot_addr(slot);
        let end_offset = self.slot_end_offset();

        // End stamp first, begin stamp last
        let end = self.io.read_u32(addr + end_offset)?;
        let len = self.io.read_u32(addr + SLOT_LEN_OFFSET)? as usize;
        if len > self.slot_size {
            warn!("Tbuf {:?} slot {slot} length {len} out of range", self.id);
            return Err(nb::Error::WouldBlock);
        }
        if len > buf.len() {
            return Err(nb::Error::Other(Error::BufferTooSmall));
        }
        self.read_bytes(addr + SLOT_DATA_OFFSET, &mut buf[..len])?;
        let begin = self.io.read_u32(addr + SLOT_BEGIN_OFFSET)?;

        if begin != seq as u32 || end != seq as u32 {
            warn!(
                "Tbuf {:?} torn read of seq {seq}: begin {begin} end {end}",
                self.id
            );
            return Err(nb::Error::WouldBlock);
        }

        let fresh = seq_is_fresh(seq, self.last_seen);
        if fresh {
            self.last_seen = seq;
        }

        Ok(Snapshot { seq, len, fresh })
    }

    /// Consumer: check for a published sequence number not yet read, without
    /// claiming a slot.
    pub fn has_fresh(&mut self) -> Result<bool> {
        consumer_only(self.role)?;
        let (seq, _) = unpack(self.read_producer()?);
        Ok(seq_is_fresh(seq, self.last_seen))
    }

    /// Consumer: acknowledge `seq` towards the producer.
    pub fn acknowledge(&mut self, seq: TbufSeq) -> Result<()> {
        consumer_only(self.role)?;
        self.write_consumer(pack(seq, self.reading))
    }

    /// Producer: whether the consumer acknowledged the latest write.  A
    /// buffer never written to counts as acknowledged.
    pub fn acknowledged(&mut self) -> Result<bool> {
        producer_only(self.role)?;
        let (seq, _) = unpack(self.read_producer()?);
        let (ack, _) = unpack(self.read_consumer()?);
        Ok(seq == ack)
    }

    /// Last sequence number this consumer observed as fresh
    pub fn last_seen(&self) -> TbufSeq {
        self.last_seen
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn role(&self) -> TbufRole {
        self.role
    }

    /// Payload bytes per slot
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }
}

// Internal functions
impl<I: TbufIo> Tbuf<I> {
    fn from_parts(io: I, role: TbufRole, desc: &TbufDescriptor) -> Self {
        Self {
            io,
            id: desc.id,
            role,
            base_addr: desc.base_addr,
            slot_size: desc.size,
            last_seen: 0,
            reading: NO_SLOT,
        }
    }

    /// Point the acknowledge register at the latest slot, then make sure the
    /// producer did not publish in between.  Busy if the producer kept
    /// moving for every attempt.
    fn claim_latest(&mut self) -> nb::Result<(TbufSeq, u32), Error> {
        let (ack, _) = unpack(self.read_consumer()?);
        let mut word = self.read_producer()?;
        for _ in 0..CLAIM_ATTEMPTS {
            let (_, slot) = unpack(word);
            self.reading = slot;
            self.write_consumer(pack(ack, slot))?;
            let recheck = self.read_producer()?;
            if recheck == word {
                return Ok(unpack(word));
            }
            trace!("Tbuf {:?} producer moved during claim", self.id);
            word = recheck;
        }
        warn!("Tbuf {:?} no stable slot after {CLAIM_ATTEMPTS} claims", self.id);
        Err(nb::Error::WouldBlock)
    }

    fn slot_addr(&self, slot: u32) -> u32 {
        slot_addr(self.base_addr, self.slot_size, slot)
    }

    fn slot_end_offset(&self) -> u32 {
        SLOT_DATA_OFFSET + self.slot_size.next_multiple_of(4) as u32
    }

    fn read_cb(&mut self, offset: u32) -> Result<u32> {
        self.io.read_u32(self.base_addr + offset)
    }

    fn write_cb(&mut self, offset: u32, value: u32) -> Result<()> {
        self.io.write_u32(self.base_addr + offset, value)
    }

    fn write_slot_size(&mut self, size: usize) -> Result<()> {
        self.write_cb(TbufCb::slot_size_offset(), size as u32)
    }

    fn read_producer(&mut self) -> Result<u32> {
        self.read_cb(TbufCb::producer_offset())
    }

    fn write_producer(&mut self, word: u32) -> Result<()> {
        self.write_cb(TbufCb::producer_offset(), word)
    }

    fn read_consumer(&mut self) -> Result<u32> {
        self.read_cb(TbufCb::consumer_offset())
    }

    fn write_consumer(&mut self, word: u32) -> Result<()> {
        self.write_cb(TbufCb::consumer_offset(), word)
    }

    fn write_bytes(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        // Aligned portion in bulk, BULK_WORDS words at a time
        let mut words = [0u32; BULK_WORDS];
        let mut word_addr = addr;
        let mut chunks = data.chunks_exact(BULK_WORDS * 4);
        for chunk in &mut chunks {
            for (word, bytes) in words.iter_mut().zip(chunk.chunks_exact(4)) {
                *word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            }
            self.io.write_bulk(word_addr, &words)?;
            word_addr += (BULK_WORDS * 4) as u32;
        }

        // Remaining words, the last one zero padded
        for bytes in chunks.remainder().chunks(4) {
            let mut final_word = 0u32;
            for (i, byte) in bytes.iter().enumerate() {
                final_word |= (*byte as u32) << (i * 8);
            }
            self.io.write_u32(word_addr, final_word)?;
            word_addr += 4;
        }
        Ok(())
    }

    fn read_bytes(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        let mut words = [0u32; BULK_WORDS];
        let mut word_addr = addr;
        let mut chunks = buf.chunks_exact_mut(BULK_WORDS * 4);
        for chunk in &mut chunks {
            self.io.read_bulk(word_addr, &mut words)?;
            for (word, bytes) in words.iter().zip(chunk.chunks_exact_mut(4)) {
                bytes.copy_from_slice(&word.to_le_bytes());
            }
            word_addr += (BULK_WORDS * 4) as u32;
        }

        for bytes in chunks.into_remainder().chunks_mut(4) {
            let word = self.io.read_u32(word_addr)?.to_le_bytes();
            bytes.copy_from_slice(&word[..bytes.len()]);
            word_addr += 4;
        }
        Ok(())
    }
}

/// RAM triple buffer type.  Used on targets sharing physical memory.
pub type RamTbuf = Tbuf<RamTbufIo>;

/// Triple buffer I/O implementation using direct RAM access
#[derive(Clone, Copy)]
pub struct RamTbufIo;

impl RamTbufIo {
    /// Create a new RamTbufIo instance.
    ///
    /// ```rust
    /// use psi::tbuf::RamTbufIo;
    ///
    /// static RAM_TBUF_IO: RamTbufIo = RamTbufIo::new();
    /// // Now use it in RamTbuf::create()
    /// ```
    // We need a new() rather than a default() as it must be const.
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {}
    }
}

impl TbufIo for RamTbufIo {
    fn read_u32(&mut self, addr: u32) -> Result<u32> {
        Ok(unsafe { core::ptr::read_volatile(addr as *const u32) })
    }

    fn write_u32(&mut self, addr: u32, value: u32) -> Result<()> {
        unsafe { core::ptr::write_volatile(addr as *mut u32, value) };
        Ok(())
    }

    fn read_bulk(&mut self, addr: u32, buf: &mut [u32]) -> Result<()> {
        for (i, word) in buf.iter_mut().enumerate() {
            *word = self.read_u32(addr + (i as u32 * 4))?;
        }
        Ok(())
    }

    fn write_bulk(&mut self, addr: u32, data: &[u32]) -> Result<()> {
        for (i, word) in data.iter().enumerate() {
            self.write_u32(addr + (i as u32 * 4), *word)?;
        }
        Ok(())
    }
}

/// Triple buffer I/O over a slice of atomic words mapped at `base`.
///
/// Lets both processors' instances share one region inside a single address
/// space - hosted simulation and tests.
#[derive(Clone, Copy)]
pub struct SliceTbufIo<'a> {
    mem: &'a [AtomicU32],
    base: u32,
}

impl<'a> SliceTbufIo<'a> {
    pub const fn new(mem: &'a [AtomicU32], base: u32) -> Self {
        Self { mem, base }
    }

    fn word(&self, addr: u32) -> Result<&AtomicU32> {
        if addr % 4 != 0 || addr < self.base {
            return Err(Error::Io);
        }
        let index = ((addr - self.base) / 4) as usize;
        self.mem.get(index).ok_or(Error::Io)
    }
}

impl TbufIo for SliceTbufIo<'_> {
    fn read_u32(&mut self, addr: u32) -> Result<u32> {
        Ok(self.word(addr)?.load(Ordering::SeqCst))
    }

    fn write_u32(&mut self, addr: u32, value: u32) -> Result<()> {
        self.word(addr)?.store(value, Ordering::SeqCst);
        Ok(())
    }

    fn read_bulk(&mut self, addr: u32, buf: &mut [u32]) -> Result<()> {
        for (i, word) in buf.iter_mut().enumerate() {
            *word = self.read_u32(addr + (i as u32 * 4))?;
        }
        Ok(())
    }

    fn write_bulk(&mut self, addr: u32, data: &[u32]) -> Result<()> {
        for (i, word) in data.iter().enumerate() {
            self.write_u32(addr + (i as u32 * 4), *word)?;
        }
        Ok(())
    }
}
