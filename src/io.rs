//! Byte level access to the other processor's buffer region over a link.
//!
//! On the serial variant of the node the AP cannot reach the PCP's memory
//! directly.  A bridge (SPI into dual-ported RAM, an SWD adapter, an in-memory
//! image in simulation) copies bytes in and out of it instead.
//! [`crate::tbuf::BridgeTbufIo`] turns a [`Bridge`] into triple buffer I/O.
//!
//! Addresses are the absolute addresses of the shared descriptor table.
//! Implementations map their own link failures to [`crate::Error::Io`].

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use core::future::Future;

use crate::Result;

/// Link into the shared buffer region
pub trait Bridge {
    /// Copy `buf.len()` bytes starting at `addr` out of the region
    fn fetch(&mut self, addr: u32, buf: &mut [u8]) -> impl Future<Output = Result<()>>;

    /// Copy `data` into the region starting at `addr`.  Four byte aligned
    /// stores of four bytes must reach the region as a single word write.
    fn store(&mut self, addr: u32, data: &[u8]) -> impl Future<Output = Result<()>>;
}
