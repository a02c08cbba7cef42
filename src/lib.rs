//! Application interface (PSI) between a fieldbus communication processor
//! (PCP) and an application processor (AP) on a dual-processor safety node.
//!
//! The PCP runs the POWERLINK/openSAFETY stack, the AP runs the user's control
//! logic.  Both processors are clocked independently and only share a memory
//! region (or a serial link mirroring it).  This crate moves process data,
//! service data, status, asynchronous messages and logbook records across
//! that boundary without locks.
//!
//! `no_std`.  Requires `alloc` only for the async remote buffer accessors.
//!
//! ## Architecture
//!
//! The base unit is the triple buffer ([`tbuf`]): a shared region holding a
//! small control block and three identical slots.  Exactly one processor
//! produces into a buffer, the other consumes from it:
//! - The producer always writes to the slot that is neither the latest one nor
//!   the one the consumer is reading, then publishes a new sequence number.
//! - The consumer claims the latest slot through the acknowledge register and
//!   reads it.  A changed sequence number is the only sign of fresh data.
//! - Per-slot stamps detect torn reads, which are reported as busy and simply
//!   retried on a later cycle.
//!
//! On top of the triple buffer:
//! - [`pdo`] - cyclic process data images linked to object dictionary entries
//! - [`status`] and [`cc`] - timestamp/status record and configuration objects
//! - [`ssdo`] - segmented safety service data transfer state machines
//! - [`asynch`] - asynchronous SPDO/SSDO message multiplexer
//! - [`logbook`] - fixed-format log records with at-least-once delivery
//! - [`xcom`] - safety-node cross-communication slim frames with CRC8/CRC16
//!   protected subframes and an injected consecutive timebase
//!
//! Support modules: [`timeout`] (cycle counted timers from a fixed pool),
//! [`fifo`] (fixed-size element ring buffer), [`crc`], [`critsec`] and [`io`].
//!
//! [`psi::Psi`] drives the AP side, [`pcp::Pcp`] the PCP side.  Both are
//! cooperative: one synchronous entry point per fieldbus cycle and one
//! asynchronous entry point from the main loop.  Nothing blocks - busy
//! conditions are reported as [`nb::Error::WouldBlock`] and retried on the
//! next cycle.
//!
//! ## Getting Started
//!
//! 1. Lay out the buffers for both processors with a table of
//!    [`config::TbufDescriptor`]s.  The table must be identical on both sides.
//! 2. On the PCP, create [`pcp::Pcp`], which initialises every buffer.
//! 3. On the AP, create [`psi::Psi`] with the same table.  It attaches to the
//!    buffers and fails with [`Error::Uninit`] until the PCP has created them.
//! 4. Link the PDO images with `configure_modules()` on both sides.
//! 5. Call `handle_sync()` from the synchronous interrupt and
//!    `handle_async()` from the main loop.
//!
//! ## Features
//!
//! Default features:
//! - `async` - Enable [`tbuf::futures`], accessing a remote buffer over an
//!   asynchronous link (requires `alloc`).

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#![cfg_attr(not(test), no_std)]

#[cfg(feature = "async")]
extern crate alloc;

pub mod asynch;
pub mod cc;
pub mod channel;
pub mod config;
pub mod crc;
pub mod critsec;
pub mod fifo;
pub mod io;
pub mod logbook;
pub mod od;
pub mod pcp;
pub mod pdo;
pub mod psi;
pub mod ssdo;
pub mod status;
pub mod tbuf;
pub mod timeout;
pub mod xcom;

pub use config::BufferId;
pub use od::AbortCode;

/// PSI errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Base address not word aligned
    NotAligned,
    /// Buffer too small for operation
    BufferTooSmall,
    /// Payload too large for buffer
    PayloadTooLarge,
    /// Buffer not yet initialised by its owner
    Uninit,
    /// Operation not allowed for this role or state
    InvalidOperation,
    /// Descriptor table names a buffer with an unusable size
    InvalidSize(BufferId),
    /// Descriptor table is missing a required buffer
    MissingBuffer(BufferId),
    /// Descriptor table contains the same buffer more than once
    DuplicateBuffer(BufferId),
    /// PDO/CC linking table does not match the object dictionary
    LinkMismatch { index: u16, subindex: u8 },
    /// Fixed instance pool exhausted
    PoolExhausted,
    /// Handle does not refer to a live pool instance
    InvalidHandle,
    /// FIFO has no free element
    FifoFull,
    /// FIFO has no element to get
    FifoEmpty,
    /// Malformed message header or frame
    Malformed,
    /// CRC mismatch in a received frame
    Crc,
    /// Transport collaborator reported a failure
    Transport,
    /// Consumer did not acknowledge in time
    Timeout,
    /// Frame built without a fresh timebase
    StaleTimebase,
    /// Access to an object that is not linked
    UnlinkedObject { index: u16, subindex: u8 },
    /// Message for a channel nobody registered
    UnknownChannel(u8),
    /// Object dictionary access aborted
    Abort(AbortCode),
    /// I/O error
    Io,
}

impl Error {
    /// Configuration errors are detected at initialisation time and are fatal.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Error::NotAligned
                | Error::BufferTooSmall
                | Error::InvalidSize(_)
                | Error::MissingBuffer(_)
                | Error::DuplicateBuffer(_)
                | Error::LinkMismatch { .. }
                | Error::PoolExhausted
        )
    }
}

/// Type to represent the result of a PSI operation
pub type Result<T> = core::result::Result<T, Error>;

/// Module which reported an error to the [`ErrorHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Status,
    Cc,
    Rpdo,
    Tpdo,
    SsdoTx,
    SsdoRx,
    AsyncTx,
    AsyncRx,
    Logbook,
    Stream,
}

/// Error handler collaborator.
///
/// Channels reset themselves before an error is reported, so the handler
/// only decides whether to log, count or escalate.
pub trait ErrorHandler {
    fn set_error(&mut self, source: Source, error: Error);
}
