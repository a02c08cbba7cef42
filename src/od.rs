//! Object dictionary collaborator (`obdAccessCb`).
//!
//! The protocol stack owns the dictionary.  PDO and configuration channel
//! modules only resolve sizes at link time and copy values through this
//! trait.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

/// Stack defined SDO abort code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortCode(pub u32);

impl AbortCode {
    /// Object does not exist in the object dictionary
    pub const NO_OBJECT: AbortCode = AbortCode(0x0602_0000);
    /// Sub-index does not exist
    pub const NO_SUBINDEX: AbortCode = AbortCode(0x0609_0011);
    /// Data type does not match, length of service parameter does not match
    pub const LENGTH_MISMATCH: AbortCode = AbortCode(0x0607_0010);
    /// Attempt to write a read only object
    pub const READ_ONLY: AbortCode = AbortCode(0x0601_0002);
    /// General error
    pub const GENERAL: AbortCode = AbortCode(0x0800_0000);
}

pub trait ObjectDictionary {
    /// Size in bytes of the object, `None` if it does not exist.
    fn object_size(&self, index: u16, subindex: u8) -> Option<usize>;

    /// Copy the object's current value into `buf`, returning its length.
    fn read(&self, index: u16, subindex: u8, buf: &mut [u8]) -> Result<usize, AbortCode>;

    /// Write a new value to the object.
    fn write(&mut self, index: u16, subindex: u8, data: &[u8]) -> Result<(), AbortCode>;
}
