//! Asynchronous triple buffer access - used by a processor reaching the
//! shared region over a serial or debug link rather than its own bus.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use alloc::boxed::Box;
use async_trait::async_trait;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::config::{BufferId, TbufDescriptor};
use crate::io::Bridge;
use crate::tbuf::{CLAIM_ATTEMPTS, NO_SLOT, Snapshot, TbufCb, TbufRole, TbufSeq};
use crate::tbuf::{SLOT_BEGIN_OFFSET, SLOT_DATA_OFFSET, SLOT_LEN_OFFSET};
use crate::tbuf::{check_base_addr, check_slot_size, consumer_only, producer_only};
use crate::tbuf::{free_slot, next_seq, pack, seq_is_fresh, slot_addr, unpack};
use crate::{Error, Result};

/// Trait for accessing a triple buffer in a shared medium (usually RAM).
///
/// Async version, typically used for accessing the medium over SPI or other
/// asynchronous links.
#[async_trait(?Send)]
pub trait AsyncTbufIo {
    /// Atomic read u32 operation
    async fn read_u32(&mut self, addr: u32) -> Result<u32>;

    /// Atomic write u32 operation
    async fn write_u32(&mut self, addr: u32, value: u32) -> Result<()>;

    /// Bulk read access, no need for atomicity
    async fn read_bulk(&mut self, addr: u32, buf: &mut [u8]) -> Result<()>;

    /// Bulk write access, no need for atomicity
    async fn write_bulk(&mut self, addr: u32, data: &[u8]) -> Result<()>;
}

/// Remote triple buffer accessor.
///
/// Borrows the link for its lifetime - create, use, drop, so one link can
/// serve several buffers in turn.
pub struct AsyncTbuf<'a, I: AsyncTbufIo> {
    io: &'a mut I,
    id: BufferId,
    role: TbufRole,
    base_addr: u32,
    slot_size: usize,
    last_seen: TbufSeq,
    reading: u32,
}

impl<'a, I: AsyncTbufIo> AsyncTbuf<'a, I> {
    /// Attach to a buffer initialised by the processor owning the memory.
    ///
    /// `last_seen` is the last sequence number a previous accessor for the
    /// same buffer observed, so freshness survives accessor re-creation.
    pub async fn attach(
        io: &'a mut I,
        role: TbufRole,
        desc: &TbufDescriptor,
        last_seen: TbufSeq,
    ) -> Result<Self> {
        check_base_addr(desc.base_addr)?;
        check_slot_size(desc.size).map_err(|_| Error::InvalidSize(desc.id))?;

        let mut tbuf = Self {
            io,
            id: desc.id,
            role,
            base_addr: desc.base_addr,
            slot_size: desc.size,
            last_seen,
            reading: NO_SLOT,
        };

        // Validate existing control block
        let slot_size = tbuf.read_cb(TbufCb::slot_size_offset()).await? as usize;
        if slot_size == 0 {
            return Err(Error::Uninit);
        }
        if slot_size != desc.size {
            return Err(Error::InvalidSize(desc.id));
        }

        debug!(
            "Attached remote tbuf {:?} {role:?} at {:#010X} slot size {slot_size} bytes",
            desc.id, desc.base_addr
        );

        Ok(tbuf)
    }

    /// Producer: copy `payload` into the free slot and publish it.
    pub async fn write(&mut self, payload: &[u8]) -> Result<TbufSeq> {
        producer_only(self.role)?;

        if payload.len() > self.slot_size {
            return Err(Error::PayloadTooLarge);
        }

        let (seq, latest) = unpack(self.read_cb(TbufCb::producer_offset()).await?);
        let (_, reading) = unpack(self.read_cb(TbufCb::consumer_offset()).await?);
        let slot = free_slot(latest, reading);
        let seq = next_seq(seq);
        let addr = slot_addr(self.base_addr, self.slot_size, slot);

        self.io
            .write_u32(addr + SLOT_BEGIN_OFFSET, seq as u32)
            .await?;
        self.io
            .write_u32(addr + SLOT_LEN_OFFSET, payload.len() as u32)
            .await?;
        self.write_padded(addr + SLOT_DATA_OFFSET, payload).await?;
        self.io
            .write_u32(addr + self.slot_end_offset(), seq as u32)
            .await?;

        // Atomically publish by writing the producer word last
        self.write_cb(TbufCb::producer_offset(), pack(seq, slot))
            .await?;

        Ok(seq)
    }

    /// Consumer: copy the most recently published slot into `buf`.
    ///
    /// A torn read returns [`nb::Error::WouldBlock`].
    pub async fn read(&mut self, buf: &mut [u8]) -> nb::Result<Snapshot, Error> {
        consumer_only(self.role)?;

        let (ack, _) = unpack(self.read_cb(TbufCb::consumer_offset()).await?);
        let mut word = self.read_cb(TbufCb::producer_offset()).await?;
        let mut claimed = None;
        for _ in 0..CLAIM_ATTEMPTS {
            let (_, slot) = unpack(word);
            self.reading = slot;
            self.write_cb(TbufCb::consumer_offset(), pack(ack, slot))
                .await?;
            let recheck = self.read_cb(TbufCb::producer_offset()).await?;
            if recheck == word {
                claimed = Some(unpack(word));
                break;
            }
            word = recheck;
        }

        let Some((seq, slot)) = claimed else {
            warn!("Remote tbuf {:?} no stable slot after {CLAIM_ATTEMPTS} claims", self.id);
            return Err(nb::Error::WouldBlock);
        };
        if seq == 0 {
            return Ok(Snapshot::EMPTY);
        }

        let addr = slot_addr(self.base_addr, self.slot_size, slot);
        let end = self.io.read_u32(addr + self.slot_end_offset()).await?;
        let len = self.io.read_u32(addr + SLOT_LEN_OFFSET).await? as usize;
        if len > self.slot_size {
            return Err(nb::Error::WouldBlock);
        }
        if len > buf.len() {
            return Err(nb::Error::Other(Error::BufferTooSmall));
        }
        self.io
            .read_bulk(addr + SLOT_DATA_OFFSET, &mut buf[..len])
            .await?;
        let begin = self.io.read_u32(addr + SLOT_BEGIN_OFFSET).await?;

        if begin != seq as u32 || end != seq as u32 {
            warn!("Remote tbuf {:?} torn read of seq {seq}", self.id);
            return Err(nb::Error::WouldBlock);
        }

        let fresh = seq_is_fresh(seq, self.last_seen);
        if fresh {
            self.last_seen = seq;
        }
        Ok(Snapshot { seq, len, fresh })
    }

    /// Consumer: acknowledge `seq` towards the producer.
    pub async fn acknowledge(&mut self, seq: TbufSeq) -> Result<()> {
        consumer_only(self.role)?;
        self.write_cb(TbufCb::consumer_offset(), pack(seq, self.reading))
            .await
    }

    /// Producer: whether the consumer acknowledged the latest write.
    pub async fn acknowledged(&mut self) -> Result<bool> {
        producer_only(self.role)?;
        let (seq, _) = unpack(self.read_cb(TbufCb::producer_offset()).await?);
        let (ack, _) = unpack(self.read_cb(TbufCb::consumer_offset()).await?);
        Ok(seq == ack)
    }

    /// Last sequence number this accessor observed as fresh
    pub fn last_seen(&self) -> TbufSeq {
        self.last_seen
    }
}

// Internal functions
impl<I: AsyncTbufIo> AsyncTbuf<'_, I> {
    fn slot_end_offset(&self) -> u32 {
        SLOT_DATA_OFFSET + self.slot_size.next_multiple_of(4) as u32
    }

    async fn read_cb(&mut self, offset: u32) -> Result<u32> {
        self.io.read_u32(self.base_addr + offset).await
    }

    async fn write_cb(&mut self, offset: u32, value: u32) -> Result<()> {
        self.io.write_u32(self.base_addr + offset, value).await
    }

    async fn write_padded(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        // Whole words in bulk, then the zero padded tail word
        let aligned = data.len() - data.len() % 4;
        if aligned > 0 {
            self.io.write_bulk(addr, &data[..aligned]).await?;
        }
        let tail = &data[aligned..];
        if !tail.is_empty() {
            let mut bytes = [0u8; 4];
            bytes[..tail.len()].copy_from_slice(tail);
            self.io
                .write_u32(addr + aligned as u32, u32::from_le_bytes(bytes))
                .await?;
        }
        Ok(())
    }
}

/// Triple buffer I/O over a [`Bridge`] link.
///
/// Words are moved little endian, matching the region's layout.
pub struct BridgeTbufIo<'a, B: Bridge> {
    bridge: &'a mut B,
}

impl<'a, B: Bridge> BridgeTbufIo<'a, B> {
    pub fn new(bridge: &'a mut B) -> Self {
        Self { bridge }
    }
}

#[async_trait(?Send)]
impl<B: Bridge> AsyncTbufIo for BridgeTbufIo<'_, B> {
    async fn read_u32(&mut self, addr: u32) -> Result<u32> {
        let mut word = [0u8; 4];
        self.bridge.fetch(addr, &mut word).await?;
        Ok(u32::from_le_bytes(word))
    }

    async fn write_u32(&mut self, addr: u32, value: u32) -> Result<()> {
        self.bridge.store(addr, &value.to_le_bytes()).await
    }

    async fn read_bulk(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        self.bridge.fetch(addr, buf).await
    }

    async fn write_bulk(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        self.bridge.store(addr, data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tbuf::{SliceTbufIo, Tbuf, TbufIo};
    use core::future::Future;
    use core::sync::atomic::AtomicU32;
    use futures_executor::block_on;

    const BASE: u32 = 0x1000;

    // Serial link simulation into the PCP's memory
    struct SerialLink<'a> {
        mem: SliceTbufIo<'a>,
    }

    impl SerialLink<'_> {
        fn copy_out(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
            for (i, chunk) in buf.chunks_mut(4).enumerate() {
                let word = self.mem.read_u32(addr + i as u32 * 4)?.to_le_bytes();
                chunk.copy_from_slice(&word[..chunk.len()]);
            }
            Ok(())
        }

        fn copy_in(&mut self, addr: u32, data: &[u8]) -> Result<()> {
            for (i, chunk) in data.chunks(4).enumerate() {
                let mut bytes = [0u8; 4];
                bytes[..chunk.len()].copy_from_slice(chunk);
                self.mem
                    .write_u32(addr + i as u32 * 4, u32::from_le_bytes(bytes))?;
            }
            Ok(())
        }
    }

    impl Bridge for SerialLink<'_> {
        fn fetch(&mut self, addr: u32, buf: &mut [u8]) -> impl Future<Output = Result<()>> {
            core::future::ready(self.copy_out(addr, buf))
        }

        fn store(&mut self, addr: u32, data: &[u8]) -> impl Future<Output = Result<()>> {
            core::future::ready(self.copy_in(addr, data))
        }
    }

    #[test]
    fn remote_consumer_reads_local_producer() {
        let mem: [AtomicU32; 64] = core::array::from_fn(|_| AtomicU32::new(0));
        let local = SliceTbufIo::new(&mem, BASE);
        let desc = TbufDescriptor::new(BufferId::Status, BASE, 16);
        let mut producer = Tbuf::create(local, TbufRole::Producer, &desc).unwrap();
        producer.write(b"timestamp-7").unwrap();

        let mut link = SerialLink { mem: local };
        let mut io = BridgeTbufIo::new(&mut link);

        block_on(async {
            let mut remote = AsyncTbuf::attach(&mut io, TbufRole::Consumer, &desc, 0)
                .await
                .unwrap();
            let mut buf = [0u8; 16];
            let snap = remote.read(&mut buf).await.unwrap();
            assert!(snap.fresh);
            assert_eq!(&buf[..snap.len], b"timestamp-7");
            remote.acknowledge(snap.seq).await.unwrap();
        });

        assert!(producer.acknowledged().unwrap());
    }

    #[test]
    fn remote_producer_feeds_local_consumer() {
        let mem: [AtomicU32; 64] = core::array::from_fn(|_| AtomicU32::new(0));
        let local = SliceTbufIo::new(&mem, BASE);
        let desc = TbufDescriptor::new(BufferId::Tpdo, BASE, 8);
        let mut consumer = Tbuf::create(local, TbufRole::Consumer, &desc).unwrap();

        let mut link = SerialLink { mem: local };
        let mut io = BridgeTbufIo::new(&mut link);

        block_on(async {
            let mut remote = AsyncTbuf::attach(&mut io, TbufRole::Producer, &desc, 0)
                .await
                .unwrap();
            assert!(remote.acknowledged().await.unwrap());
            remote.write(&[1, 2, 3, 4, 5, 6, 7]).await.unwrap();
        });

        let mut buf = [0u8; 8];
        let snap = consumer.read(&mut buf).unwrap();
        assert!(snap.fresh);
        assert_eq!(&buf[..snap.len], &[1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn remote_consumer_catches_up_after_falling_behind() {
        let mem: [AtomicU32; 64] = core::array::from_fn(|_| AtomicU32::new(0));
        let local = SliceTbufIo::new(&mem, BASE);
        let desc = TbufDescriptor::new(BufferId::Rpdo, BASE, 4);
        let mut producer = Tbuf::create(local, TbufRole::Producer, &desc).unwrap();
        let mut link = SerialLink { mem: local };
        let mut io = BridgeTbufIo::new(&mut link);

        block_on(async {
            let mut remote = AsyncTbuf::attach(&mut io, TbufRole::Consumer, &desc, 0)
                .await
                .unwrap();
            let mut buf = [0u8; 4];
            producer.write(&[1]).unwrap();
            assert!(remote.read(&mut buf).await.unwrap().fresh);

            for value in 0..200u8 {
                producer.write(&[value]).unwrap();
            }
            let snap = remote.read(&mut buf).await.unwrap();
            assert_eq!(snap.seq, 201);
            assert!(snap.fresh);
            assert_eq!(buf[0], 199);
        });
    }
}
