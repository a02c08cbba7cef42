//! AP side orchestrator.
//!
//! Attaches to the buffers the PCP created and drives every AP end:
//!
//! | buffer   | AP end                  |
//! |----------|-------------------------|
//! | Status   | [`StatusConsumer`]      |
//! | Cc       | [`CcProducer`]          |
//! | Rpdo     | [`PdoConsumer`]         |
//! | Tpdo     | [`PdoProducer`]         |
//! | SsdoTx   | [`TxProducer`]          |
//! | SsdoRx   | [`RxConsumer`]          |
//! | AsyncTx  | [`AsyncSender`]         |
//! | AsyncRx  | [`AsyncReceiver`]       |
//! | Logbook  | [`LogbookProducer`]     |
//!
//! [`Psi::handle_sync()`] runs once per fieldbus cycle from the synchronous
//! interrupt, [`Psi::handle_async()`] from the main loop.  Neither blocks.
//! Channel errors go to the application's [`ErrorHandler`], busy conditions
//! are retried on the next call.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::asynch::{AsyncReceiver, AsyncRoutes, AsyncSender};
use crate::cc::CcProducer;
use crate::config::{BufferId, Processor, PsiConfig};
use crate::crc::FrameCrc;
use crate::critsec::{self, CriticalSection};
use crate::logbook::{LogEntry, LogbookProducer};
use crate::od::ObjectDictionary;
use crate::pdo::{PdoConsumer, PdoLink, PdoProducer};
use crate::ssdo::{RxConsumer, SsdoHandler, TxProducer};
use crate::status::StatusConsumer;
use crate::tbuf::{Tbuf, TbufIo};
use crate::timeout::TimeoutPool;
use crate::{Error, ErrorHandler, Result, Source};

/// Application collaborator on the AP
pub trait Application: ErrorHandler + SsdoHandler + AsyncRoutes {
    /// Synchronous callback, between reading the RPDO image and publishing
    /// the TPDO image.
    fn sync<I: TbufIo>(&mut self, rpdo: &PdoConsumer<I>, tpdo: &mut PdoProducer<I>) -> Result<()>;

    /// Stream handler action before the cycle is processed, e.g. fetching
    /// the local image over a serial link
    fn stream_pre_sync(&mut self) -> Result<()> {
        Ok(())
    }

    /// Stream handler action after the cycle is processed
    fn stream_post_sync(&mut self) -> Result<()> {
        Ok(())
    }
}

/// AP side of the interface
pub struct Psi<I, C, K, A>
where
    I: TbufIo + Clone,
    C: CriticalSection,
    K: FrameCrc,
    A: Application,
{
    status: StatusConsumer<I>,
    cc: CcProducer<I>,
    rpdo: PdoConsumer<I>,
    tpdo: PdoProducer<I>,
    ssdo_tx: TxProducer<I>,
    ssdo_rx: RxConsumer<I>,
    async_tx: AsyncSender<I>,
    async_rx: AsyncReceiver<I>,
    logbook: LogbookProducer<I>,
    pool: TimeoutPool,
    crit: C,
    crc: K,
    app: A,
}

impl<I, C, K, A> Psi<I, C, K, A>
where
    I: TbufIo + Clone,
    C: CriticalSection,
    K: FrameCrc,
    A: Application,
{
    /// Attach to every buffer of `config`.
    ///
    /// Arguments:
    /// - `config` - buffer layout, identical to the PCP's
    /// - `io` - access to the shared medium, cloned for each buffer
    /// - `crit` - critical section guarding the synchronous processing
    /// - `crc` - CRC used to validate received xcom frames
    /// - `app` - application callbacks
    ///
    /// A missing or mismatching buffer fails the whole initialisation.
    /// [`Error::Uninit`] means the PCP has not created the buffers yet.
    pub fn init(config: &PsiConfig<'_>, io: I, crit: C, crc: K, app: A) -> Result<Self> {
        let mut pool = TimeoutPool::new();
        let attach = |id: BufferId| -> Result<Tbuf<I>> {
            let desc = config.required(id)?;
            Tbuf::attach(io.clone(), id.role_for(Processor::Ap), &desc)
        };

        let psi = Self {
            status: StatusConsumer::new(attach(BufferId::Status)?)?,
            cc: CcProducer::new(attach(BufferId::Cc)?)?,
            rpdo: PdoConsumer::new(attach(BufferId::Rpdo)?)?,
            tpdo: PdoProducer::new(attach(BufferId::Tpdo)?)?,
            ssdo_tx: TxProducer::new(attach(BufferId::SsdoTx)?, config.ssdo_channel)?,
            ssdo_rx: RxConsumer::new(attach(BufferId::SsdoRx)?)?,
            async_tx: AsyncSender::new(attach(BufferId::AsyncTx)?, config.async_channel)?,
            async_rx: AsyncReceiver::new(attach(BufferId::AsyncRx)?)?,
            logbook: LogbookProducer::new(
                attach(BufferId::Logbook)?,
                &mut pool,
                config.logbook_timeout,
            )?,
            pool,
            crit,
            crc,
            app,
        };

        info!("PSI attached {} buffers", BufferId::ALL.len());
        Ok(psi)
    }

    /// Resolve the PDO linking tables against the object dictionary
    pub fn configure_modules(
        &mut self,
        od: &impl ObjectDictionary,
        rpdo_links: &[PdoLink],
        tpdo_links: &[PdoLink],
    ) -> Result<()> {
        self.rpdo.link(od, rpdo_links)?;
        self.tpdo.link(od, tpdo_links)?;
        Ok(())
    }

    /// Accept async messages for `channel`
    pub fn register_async_channel(&mut self, channel: u8) -> Result<()> {
        self.async_rx.register(channel)
    }

    /// Synchronous processing, once per fieldbus cycle.
    ///
    /// Runs inside the critical section.  Only a failing application
    /// callback is returned.  Channel and stream errors go to the error
    /// handler; a failed stream pre-action skips the cycle, a busy or failed
    /// RPDO read skips the application callback and the TPDO publish.
    pub fn handle_sync(&mut self) -> Result<()> {
        let Self {
            status,
            rpdo,
            tpdo,
            logbook,
            pool,
            crit,
            app,
            ..
        } = self;

        critsec::with(crit, || {
            let streamed = app.stream_pre_sync().map_err(nb::Error::Other);
            if report(app, Source::Stream, streamed).is_none() {
                return Ok(());
            }

            report(app, Source::Status, status.process_sync());

            // The application only runs on a consistent RPDO image
            if report(app, Source::Rpdo, rpdo.process_sync()).is_some() {
                app.sync(rpdo, tpdo)?;
                tpdo.proc_finished();
                let result = tpdo.process_sync().map_err(nb::Error::Other);
                report(app, Source::Tpdo, result);
            } else {
                trace!("RPDO image unavailable, application sync skipped");
            }

            let result = logbook.process_sync(pool).map_err(nb::Error::Other);
            report(app, Source::Logbook, result);

            let streamed = app.stream_post_sync().map_err(nb::Error::Other);
            report(app, Source::Stream, streamed);
            Ok(())
        })
    }

    /// Asynchronous processing, from the main loop
    pub fn handle_async(&mut self) {
        let result = self.ssdo_rx.process(&mut self.app);
        report(&mut self.app, Source::SsdoRx, result);
        let result = self.async_rx.process(&self.crc, &mut self.app);
        report(&mut self.app, Source::AsyncRx, result);
        let result = self.cc.process_async();
        report(&mut self.app, Source::Cc, result);
    }

    /// Post an SSDO frame.  Busy until the previous one was transmitted.
    pub fn post_ssdo(&mut self, payload: &[u8]) -> nb::Result<(), Error> {
        self.ssdo_tx.post_payload(payload)
    }

    /// Queue an object write on the configuration channel
    pub fn write_object(&mut self, index: u16, subindex: u8, data: &[u8]) -> nb::Result<(), Error> {
        self.cc.write_object(index, subindex, data)
    }

    /// Post a logbook record.  Busy until the previous one was acknowledged.
    pub fn post_log_entry(&mut self, entry: &LogEntry) -> nb::Result<(), Error> {
        self.logbook.post_log_entry(&mut self.pool, entry)
    }

    /// Async sender, e.g. as the [`crate::xcom::Shnf`] of an xcom builder
    pub fn async_tx(&mut self) -> &mut AsyncSender<I> {
        &mut self.async_tx
    }

    pub fn status(&self) -> &StatusConsumer<I> {
        &self.status
    }

    pub fn rpdo(&self) -> &PdoConsumer<I> {
        &self.rpdo
    }

    pub fn app(&self) -> &A {
        &self.app
    }

    pub fn app_mut(&mut self) -> &mut A {
        &mut self.app
    }
}

// Forward a channel error to the error handler.  Busy is not an error.
pub(crate) fn report<T>(
    handler: &mut impl ErrorHandler,
    source: Source,
    result: nb::Result<T, Error>,
) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(nb::Error::WouldBlock) => None,
        Err(nb::Error::Other(e)) => {
            if e.is_config() {
                error!("{source:?} configuration error {e:?}");
            } else {
                warn!("{source:?} reported {e:?}");
            }
            handler.set_error(source, e);
            None
        }
    }
}
