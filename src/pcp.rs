//! PCP side orchestrator.
//!
//! Owns the shared memory: [`Pcp::init()`] creates every buffer, after which
//! the AP can attach.  Network events enter through
//! [`Pcp::handle_incoming_ssdo()`] and [`Pcp::tx_transfer_finished()`].

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::asynch::{AsyncReceiver, AsyncRoutes, AsyncSender};
use crate::cc::{CcConsumer, CcLink};
use crate::config::{BufferId, Processor, PsiConfig};
use crate::crc::FrameCrc;
use crate::logbook::{LogHandler, LogbookConsumer};
use crate::od::ObjectDictionary;
use crate::pdo::{PdoConsumer, PdoLink, PdoProducer};
use crate::psi::report;
use crate::ssdo::{IncomingFrame, RxProducer, SsdoTransport, TxConsumer};
use crate::status::StatusProducer;
use crate::tbuf::{Tbuf, TbufIo};
use crate::timeout::TimeoutPool;
use crate::{Error, ErrorHandler, Result, Source};

/// Collaborators the PCP reports to
pub trait PcpHandler: ErrorHandler + AsyncRoutes + LogHandler {}

impl<T: ErrorHandler + AsyncRoutes + LogHandler> PcpHandler for T {}

/// PCP side of the interface
pub struct Pcp<I: TbufIo + Clone, K: FrameCrc> {
    status: StatusProducer<I>,
    cc: CcConsumer<I>,
    rpdo: PdoProducer<I>,
    tpdo: PdoConsumer<I>,
    ssdo_tx: TxConsumer<I>,
    ssdo_rx: RxProducer<I>,
    async_tx: AsyncReceiver<I>,
    async_rx: AsyncSender<I>,
    logbook: LogbookConsumer<I>,
    pool: TimeoutPool,
    crc: K,
}

impl<I: TbufIo + Clone, K: FrameCrc> Pcp<I, K> {
    /// Create every buffer of `config`.  Any invalid descriptor fails the
    /// whole initialisation.
    pub fn init(config: &PsiConfig<'_>, io: I, crc: K) -> Result<Self> {
        let mut pool = TimeoutPool::new();
        let create = |id: BufferId| -> Result<Tbuf<I>> {
            let desc = config.required(id)?;
            Tbuf::create(io.clone(), id.role_for(Processor::Pcp), &desc)
        };

        let ssdo_tx = TxConsumer::new(create(BufferId::SsdoTx)?, &mut pool, config.arp_retry_cycles)?;
        let ssdo_rx = RxProducer::new(
            create(BufferId::SsdoRx)?,
            config.ssdo_channel,
            &mut pool,
            config.ssdo_ack_timeout,
        )?;
        let pcp = Self {
            status: StatusProducer::new(create(BufferId::Status)?)?,
            cc: CcConsumer::new(create(BufferId::Cc)?)?,
            rpdo: PdoProducer::new(create(BufferId::Rpdo)?)?,
            tpdo: PdoConsumer::new(create(BufferId::Tpdo)?)?,
            ssdo_tx,
            ssdo_rx,
            async_tx: AsyncReceiver::new(create(BufferId::AsyncTx)?)?,
            async_rx: AsyncSender::new(create(BufferId::AsyncRx)?, config.async_channel)?,
            logbook: LogbookConsumer::new(create(BufferId::Logbook)?)?,
            pool,
            crc,
        };

        info!("PCP created {} buffers", BufferId::ALL.len());
        Ok(pcp)
    }

    /// Resolve the PDO and configuration channel linking tables
    pub fn configure_modules(
        &mut self,
        od: &impl ObjectDictionary,
        rpdo_links: &[PdoLink],
        tpdo_links: &[PdoLink],
        cc_links: &[CcLink],
    ) -> Result<()> {
        self.rpdo.link(od, rpdo_links)?;
        self.tpdo.link(od, tpdo_links)?;
        self.cc.link_objects(od, cc_links)?;
        Ok(())
    }

    /// Accept async messages from the AP for `channel`
    pub fn register_async_channel(&mut self, channel: u8) -> Result<()> {
        self.async_tx.register(channel)
    }

    /// Synchronous processing, once per fieldbus cycle.
    ///
    /// Publishes the status record and the RPDO image taken from `od`,
    /// applies a fresh TPDO image to `od` and counts the SSDO timers.
    pub fn handle_sync(
        &mut self,
        od: &mut impl ObjectDictionary,
        timestamp: u64,
        handler: &mut impl PcpHandler,
    ) {
        let result = self.status.process_sync(timestamp).map_err(nb::Error::Other);
        report(handler, Source::Status, result);

        let result = self.publish_rpdo(&*od).map_err(nb::Error::Other);
        report(handler, Source::Rpdo, result);

        if let Some(true) = report(handler, Source::Tpdo, self.tpdo.process_sync()) {
            let result = self.tpdo.copy_to(od).map_err(nb::Error::Other);
            report(handler, Source::Tpdo, result);
        }

        let result = self.ssdo_tx.process_sync(&mut self.pool).map_err(nb::Error::Other);
        report(handler, Source::SsdoTx, result);
        let result = self.ssdo_rx.process_sync(&mut self.pool).map_err(nb::Error::Other);
        report(handler, Source::SsdoRx, result);
    }

    /// Asynchronous processing, from the main loop
    pub fn handle_async(
        &mut self,
        od: &mut impl ObjectDictionary,
        transport: &mut impl SsdoTransport,
        handler: &mut impl PcpHandler,
    ) {
        let result = self.ssdo_tx.process(&mut self.pool, transport);
        report(handler, Source::SsdoTx, result);
        let result = self.ssdo_rx.process(&mut self.pool);
        report(handler, Source::SsdoRx, result);
        let result = self.cc.process_async(od);
        report(handler, Source::Cc, result);
        let result = self.async_tx.process(&self.crc, handler);
        report(handler, Source::AsyncTx, result);
        let result = self.logbook.process(handler);
        report(handler, Source::Logbook, result);
    }

    /// SSDO frame from the network.  Busy while the receive FIFO is full.
    pub fn handle_incoming_ssdo(&mut self, frame: &IncomingFrame<'_>) -> nb::Result<(), Error> {
        self.ssdo_rx.handle_incoming(frame)
    }

    /// Transport callback, the SSDO frame handed off was sent
    pub fn tx_transfer_finished(&mut self) -> Result<()> {
        self.ssdo_tx.tx_transfer_finished()
    }

    /// Stack state published in the status record
    pub fn set_state(&mut self, state: u8) {
        self.status.set_state(state);
    }

    fn publish_rpdo(&mut self, od: &impl ObjectDictionary) -> Result<bool> {
        self.rpdo.copy_from(od)?;
        self.rpdo.proc_finished();
        self.rpdo.process_sync()
    }

    /// Async sender towards the AP
    pub fn async_rx(&mut self) -> &mut AsyncSender<I> {
        &mut self.async_rx
    }

    pub fn ssdo_rx(&self) -> &RxProducer<I> {
        &self.ssdo_rx
    }

    pub fn ssdo_tx(&self) -> &TxConsumer<I> {
        &self.ssdo_tx
    }
}
