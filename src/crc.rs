//! CRC primitives protecting xcom subframes.
//!
//! The framing code only depends on [`FrameCrc`], so a target can plug in a
//! hardware CRC unit.  [`OpenSafetyCrc`] is the bitwise software version.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

/// openSAFETY CRC8 polynomial
pub const CRC8_POLY: u8 = 0x2F;

/// openSAFETY CRC16 polynomial
pub const CRC16_POLY: u16 = 0x5935;

/// CRC collaborator used by [`crate::xcom`]
pub trait FrameCrc {
    fn crc8(&self, seed: u8, data: &[u8]) -> u8;
    fn crc16(&self, seed: u16, data: &[u8]) -> u16;
}

/// Software CRC, MSB first, no reflection, no final XOR
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenSafetyCrc;

impl FrameCrc for OpenSafetyCrc {
    fn crc8(&self, seed: u8, data: &[u8]) -> u8 {
        let mut crc = seed;
        for &byte in data {
            crc ^= byte;
            for _ in 0..8 {
                if (crc & 0x80) != 0 {
                    crc = (crc << 1) ^ CRC8_POLY;
                } else {
                    crc <<= 1;
                }
            }
        }
        crc
    }

    fn crc16(&self, seed: u16, data: &[u8]) -> u16 {
        let mut crc = seed;
        for &byte in data {
            crc ^= (byte as u16) << 8;
            for _ in 0..8 {
                if (crc & 0x8000) != 0 {
                    crc = (crc << 1) ^ CRC16_POLY;
                } else {
                    crc <<= 1;
                }
            }
        }
        crc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_input_keeps_zero_seed() {
        let crc = OpenSafetyCrc;
        assert_eq!(crc.crc8(0, &[0, 0, 0]), 0);
        assert_eq!(crc.crc16(0, &[0, 0]), 0);
    }

    #[test]
    fn single_bit_is_polynomial() {
        let crc = OpenSafetyCrc;
        // 0x01 shifted out through eight rounds leaves the polynomial
        assert_eq!(crc.crc8(0, &[0x01]), CRC8_POLY);
        assert_eq!(crc.crc16(0, &[0x00, 0x01]), CRC16_POLY);
    }

    #[test]
    fn detects_single_byte_change() {
        let crc = OpenSafetyCrc;
        let data = [0x12, 0x34, 0x56, 0x78];
        let mut corrupted = data;
        corrupted[2] ^= 0x01;
        assert_ne!(crc.crc8(0, &data), crc.crc8(0, &corrupted));
        assert_ne!(crc.crc16(0, &data), crc.crc16(0, &corrupted));
    }
}
