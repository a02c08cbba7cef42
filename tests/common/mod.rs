// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#![allow(dead_code)]

use std::sync::atomic::AtomicU32;

use psi::asynch::AsyncHandler;
use psi::config::{BufferId, TbufDescriptor};
use psi::logbook::{LogEntry, LogHandler};
use psi::od::{AbortCode, ObjectDictionary};
use psi::pdo::{PdoConsumer, PdoProducer};
use psi::psi::Application;
use psi::ssdo::{Handoff, SsdoHandler, SsdoTransport};
use psi::tbuf::{TbufIo, region_size};
use psi::xcom::XcomFrame;
use psi::{Error, ErrorHandler, Source};

pub const BASE: u32 = 0x0800_0000;

/// Zeroed shared region of `words` 32-bit words
pub fn memory(words: usize) -> Box<[AtomicU32]> {
    (0..words).map(|_| AtomicU32::new(0)).collect()
}

/// Payload size of every buffer in the test layout
pub fn size_of(id: BufferId) -> usize {
    match id {
        BufferId::Status => 16,
        BufferId::Cc => 18,
        BufferId::Rpdo => 8,
        BufferId::Tpdo => 16,
        BufferId::SsdoTx | BufferId::SsdoRx => 6 + 256,
        BufferId::AsyncTx | BufferId::AsyncRx => 6 + 128,
        BufferId::Logbook => 16,
    }
}

/// Buffers laid out back to back from [`BASE`]
pub fn layout() -> Vec<TbufDescriptor> {
    let mut addr = BASE;
    BufferId::ALL
        .iter()
        .map(|id| {
            let desc = TbufDescriptor::new(*id, addr, size_of(*id));
            addr += region_size(desc.size) as u32;
            desc
        })
        .collect()
}

/// Words needed by [`layout()`]
pub fn layout_words() -> usize {
    layout().iter().map(|desc| desc.region_size() / 4).sum()
}

/// Flat object dictionary
#[derive(Default, Clone)]
pub struct TestOd {
    pub objects: Vec<(u16, u8, Vec<u8>)>,
}

impl TestOd {
    pub fn with(objects: &[(u16, u8, &[u8])]) -> Self {
        Self {
            objects: objects
                .iter()
                .map(|(index, sub, value)| (*index, *sub, value.to_vec()))
                .collect(),
        }
    }

    pub fn value(&self, index: u16, subindex: u8) -> Option<&[u8]> {
        self.objects
            .iter()
            .find(|(i, s, _)| *i == index && *s == subindex)
            .map(|(_, _, value)| value.as_slice())
    }
}

impl ObjectDictionary for TestOd {
    fn object_size(&self, index: u16, subindex: u8) -> Option<usize> {
        self.value(index, subindex).map(<[u8]>::len)
    }

    fn read(&self, index: u16, subindex: u8, buf: &mut [u8]) -> Result<usize, AbortCode> {
        let value = self.value(index, subindex).ok_or(AbortCode::NO_OBJECT)?;
        buf[..value.len()].copy_from_slice(value);
        Ok(value.len())
    }

    fn write(&mut self, index: u16, subindex: u8, data: &[u8]) -> Result<(), AbortCode> {
        let entry = self
            .objects
            .iter_mut()
            .find(|(i, s, _)| *i == index && *s == subindex)
            .ok_or(AbortCode::NO_OBJECT)?;
        if entry.2.len() != data.len() {
            return Err(AbortCode::LENGTH_MISMATCH);
        }
        entry.2.copy_from_slice(data);
        Ok(())
    }
}

/// AP application: loops the first RPDO object back into the TPDO
#[derive(Default)]
pub struct ApApp {
    pub ssdo: Vec<Vec<u8>>,
    pub frames: Vec<(u8, Vec<u8>)>,
    pub errors: Vec<(Source, Error)>,
    pub syncs: u32,
    /// Fail the stream pre-action with this error
    pub stream_error: Option<Error>,
}

impl ErrorHandler for ApApp {
    fn set_error(&mut self, source: Source, error: Error) {
        self.errors.push((source, error));
    }
}

impl SsdoHandler for ApApp {
    fn ssdo_received(&mut self, _channel: u8, payload: &[u8]) {
        self.ssdo.push(payload.to_vec());
    }
}

impl AsyncHandler for ApApp {
    fn async_received(&mut self, channel: u8, frame: &XcomFrame<'_>) {
        self.frames.push((channel, frame.data.to_vec()));
    }
}

impl Application for ApApp {
    fn sync<I: TbufIo>(
        &mut self,
        rpdo: &PdoConsumer<I>,
        tpdo: &mut PdoProducer<I>,
    ) -> psi::Result<()> {
        self.syncs += 1;
        let value = rpdo.object(0x6000, 1)?;
        tpdo.set_object(0x6200, 1, value)
    }

    fn stream_pre_sync(&mut self) -> psi::Result<()> {
        self.stream_error.map_or(Ok(()), Err)
    }
}

/// PCP side collaborators
#[derive(Default)]
pub struct PcpApp {
    pub frames: Vec<(u8, Vec<u8>)>,
    pub logs: Vec<LogEntry>,
    pub errors: Vec<(Source, Error)>,
}

impl ErrorHandler for PcpApp {
    fn set_error(&mut self, source: Source, error: Error) {
        self.errors.push((source, error));
    }
}

impl AsyncHandler for PcpApp {
    fn async_received(&mut self, channel: u8, frame: &XcomFrame<'_>) {
        self.frames.push((channel, frame.data.to_vec()));
    }
}

impl LogHandler for PcpApp {
    fn log_entry(&mut self, entry: &LogEntry) {
        self.logs.push(*entry);
    }
}

/// Network transport which queues every frame immediately
#[derive(Default)]
pub struct Network {
    pub sent: Vec<(u8, Vec<u8>)>,
}

impl SsdoTransport for Network {
    fn transmit(&mut self, channel: u8, payload: &[u8]) -> psi::Result<Handoff> {
        self.sent.push((channel, payload.to_vec()));
        Ok(Handoff::Queued)
    }
}
