//! Cross-communication framing of the safety node.
//!
//! An xcom message wraps one safety frame:
//!
//! | offset | field                                   |
//! |--------|-----------------------------------------|
//! | 0      | format ([`MsgFormat`])                  |
//! | 1      | flags, bit 0 set for slim frames        |
//! | 2..4   | frame length, little endian             |
//! | 4..12  | consecutive timebase, little endian     |
//! | 12..   | frame                                   |
//!
//! A frame consists of two subframes, each a 5-byte header
//! `[adr_id u16 LE][le u8][ct u16 LE]`, `le` data bytes and a CRC.  The CRC
//! is CRC8 for up to [`CRC8_MAX_DATA`] data bytes, CRC16 (little endian)
//! beyond.  Subframe 2 always uses subframe 1's CRC kind, seeded with the
//! complement of subframe 1's seed.
//!
//! Full frames carry subframe 1 then subframe 2, both with the data.  Slim
//! frames put a header only subframe 2 first, with subframe 1 following at
//! [`SLIM_FRAME_SUB1_POS_CRC8`] or [`SLIM_FRAME_SUB1_POS_CRC16`].
//!
//! The `ct` field of both subframes carries the low 16 bits of the timebase
//! set with [`Xcom::set_current_timebase()`].  Each build consumes the
//! timebase, and building again without a new one fails with
//! [`Error::StaleTimebase`] before anything is transmitted.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::channel::MsgFormat;
use crate::config::{ASYNC_MAX_PAYLOAD, XCOM_MAX_DATA};
use crate::crc::FrameCrc;
use crate::{Error, Result};

/// Length of the xcom message header preceding the frame
pub const MESSAGE_HEADER_LEN: usize = 12;

/// Length of a subframe header
pub const SUBFRAME_HEADER_LEN: usize = 5;

/// Largest subframe data protected by CRC8
pub const CRC8_MAX_DATA: usize = 19;

/// Offset of subframe 1 in a slim frame protected by CRC8
pub const SLIM_FRAME_SUB1_POS_CRC8: usize = 6;

/// Offset of subframe 1 in a slim frame protected by CRC16
pub const SLIM_FRAME_SUB1_POS_CRC16: usize = 7;

/// Largest xcom message
pub const XCOM_MAX_MSG: usize = ASYNC_MAX_PAYLOAD;

const FLAG_SLIM: u8 = 0x01;
const SUB1_SEED: u16 = 0;
const ADR_MASK: u16 = 0x03FF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CrcKind {
    Crc8,
    Crc16,
}

impl CrcKind {
    fn for_data(le: usize) -> Self {
        if le <= CRC8_MAX_DATA {
            CrcKind::Crc8
        } else {
            CrcKind::Crc16
        }
    }

    fn len(self) -> usize {
        match self {
            CrcKind::Crc8 => 1,
            CrcKind::Crc16 => 2,
        }
    }
}

/// Transmit and dispatch layer below the cross-communication (SHNF)
pub trait Shnf {
    /// Send one complete xcom message.  Busy if the layer cannot take it
    /// this cycle.
    fn transmit(&mut self, msg: &[u8]) -> nb::Result<(), Error>;
}

/// Parsed view of an xcom message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XcomFrame<'a> {
    pub format: MsgFormat,
    pub slim: bool,
    pub timebase: u64,
    /// 10-bit safety address
    pub adr: u16,
    /// 6-bit frame id
    pub id: u8,
    pub data: &'a [u8],
}

/// Frame builder
pub struct Xcom<C: FrameCrc> {
    crc: C,
    timebase: Option<u64>,
    buf: [u8; XCOM_MAX_MSG],
}

impl<C: FrameCrc> Xcom<C> {
    pub fn new(crc: C) -> Self {
        Self {
            crc,
            timebase: None,
            buf: [0; XCOM_MAX_MSG],
        }
    }

    /// Provide the consecutive timebase for the next build
    pub fn set_current_timebase(&mut self, timebase: u64) {
        self.timebase = Some(timebase);
    }

    /// Build and transmit a full SPDO frame
    pub fn post_spdo_frame(
        &mut self,
        shnf: &mut impl Shnf,
        adr: u16,
        id: u8,
        data: &[u8],
    ) -> nb::Result<(), Error> {
        let len = self.build(MsgFormat::SpdoSet, false, adr, id, data)?;
        shnf.transmit(&self.buf[..len])
    }

    /// Build and transmit an SSDO or SNMT frame, slim if `is_slim`
    pub fn post_ssdo_snmt_frame(
        &mut self,
        shnf: &mut impl Shnf,
        adr: u16,
        id: u8,
        data: &[u8],
        is_slim: bool,
    ) -> nb::Result<(), Error> {
        let len = self.build(MsgFormat::SsdoSet, is_slim, adr, id, data)?;
        shnf.transmit(&self.buf[..len])
    }

    /// Build a message into the internal buffer, returning its length
    pub fn build(
        &mut self,
        format: MsgFormat,
        slim: bool,
        adr: u16,
        id: u8,
        data: &[u8],
    ) -> Result<usize> {
        if data.len() > XCOM_MAX_DATA {
            return Err(Error::PayloadTooLarge);
        }
        let Some(timebase) = self.timebase.take() else {
            error!("xcom frame built without a fresh timebase");
            return Err(Error::StaleTimebase);
        };

        let kind = CrcKind::for_data(data.len());
        let ct = timebase as u16;
        let frame = &mut self.buf[MESSAGE_HEADER_LEN..];
        let frame_len = if slim {
            let sub1 = SUBFRAME_HEADER_LEN + kind.len();
            write_subframe(&self.crc, kind, !SUB1_SEED, &mut frame[..], adr, id, ct, &[]);
            sub1 + write_subframe(&self.crc, kind, SUB1_SEED, &mut frame[sub1..], adr, id, ct, data)
        } else {
            let sub1 = write_subframe(&self.crc, kind, SUB1_SEED, &mut frame[..], adr, id, ct, data);
            sub1 + write_subframe(&self.crc, kind, !SUB1_SEED, &mut frame[sub1..], adr, id, ct, data)
        };

        self.buf[0] = format as u8;
        self.buf[1] = if slim { FLAG_SLIM } else { 0 };
        self.buf[2..4].copy_from_slice(&(frame_len as u16).to_le_bytes());
        self.buf[4..12].copy_from_slice(&timebase.to_le_bytes());

        trace!("xcom {format:?} frame {frame_len} bytes slim {slim} ct {ct}");
        Ok(MESSAGE_HEADER_LEN + frame_len)
    }
}

// Write one subframe at the start of `out`, returning its length.  `out` is
// always large enough: the message buffer holds two maximum subframes.
#[allow(clippy::too_many_arguments)]
fn write_subframe(
    crc: &impl FrameCrc,
    kind: CrcKind,
    seed: u16,
    out: &mut [u8],
    adr: u16,
    id: u8,
    ct: u16,
    data: &[u8],
) -> usize {
    let adr_id = (adr & ADR_MASK) | ((id as u16) << 10);
    out[0..2].copy_from_slice(&adr_id.to_le_bytes());
    out[2] = data.len() as u8;
    out[3..5].copy_from_slice(&ct.to_le_bytes());
    let covered = SUBFRAME_HEADER_LEN + data.len();
    out[SUBFRAME_HEADER_LEN..covered].copy_from_slice(data);
    match kind {
        CrcKind::Crc8 => out[covered] = crc.crc8(seed as u8, &out[..covered]),
        CrcKind::Crc16 => {
            let value = crc.crc16(seed, &out[..covered]);
            out[covered..covered + 2].copy_from_slice(&value.to_le_bytes());
        }
    }
    covered + kind.len()
}

// Decoded subframe header and data
struct Subframe<'a> {
    adr_id: u16,
    ct: u16,
    data: &'a [u8],
}

// Validate the subframe at the start of `buf`, which must be exactly its
// length
fn check_subframe<'a>(
    crc: &impl FrameCrc,
    kind: CrcKind,
    seed: u16,
    buf: &'a [u8],
) -> Result<Subframe<'a>> {
    if buf.len() < SUBFRAME_HEADER_LEN + kind.len() {
        return Err(Error::Malformed);
    }
    let le = buf[2] as usize;
    let covered = SUBFRAME_HEADER_LEN + le;
    if buf.len() != covered + kind.len() {
        return Err(Error::Malformed);
    }
    let valid = match kind {
        CrcKind::Crc8 => crc.crc8(seed as u8, &buf[..covered]) == buf[covered],
        CrcKind::Crc16 => {
            crc.crc16(seed, &buf[..covered]) == u16::from_le_bytes([buf[covered], buf[covered + 1]])
        }
    };
    if !valid {
        return Err(Error::Crc);
    }
    Ok(Subframe {
        adr_id: u16::from_le_bytes([buf[0], buf[1]]),
        ct: u16::from_le_bytes([buf[3], buf[4]]),
        data: &buf[SUBFRAME_HEADER_LEN..covered],
    })
}

/// Parse and validate an xcom message.
///
/// Both subframe CRCs are checked before anything is returned.  Fails with
/// [`Error::Crc`] on a CRC mismatch and [`Error::Malformed`] on any layout
/// or consistency problem.
pub fn parse<'a>(crc: &impl FrameCrc, msg: &'a [u8]) -> Result<XcomFrame<'a>> {
    if msg.len() < MESSAGE_HEADER_LEN {
        return Err(Error::Malformed);
    }
    let format = MsgFormat::try_from(msg[0])?;
    let slim = msg[1] & FLAG_SLIM != 0;
    let frame_len = u16::from_le_bytes([msg[2], msg[3]]) as usize;
    let mut timebase = [0u8; 8];
    timebase.copy_from_slice(&msg[4..12]);
    let timebase = u64::from_le_bytes(timebase);
    let frame = msg
        .get(MESSAGE_HEADER_LEN..MESSAGE_HEADER_LEN + frame_len)
        .ok_or(Error::Malformed)?;

    let (sub1, sub2) = if slim {
        parse_slim(crc, frame)?
    } else {
        parse_full(crc, frame)?
    };

    if sub1.adr_id != sub2.adr_id || sub1.ct != sub2.ct || sub1.ct != timebase as u16 {
        return Err(Error::Malformed);
    }

    Ok(XcomFrame {
        format,
        slim,
        timebase,
        adr: sub1.adr_id & ADR_MASK,
        id: (sub1.adr_id >> 10) as u8,
        data: sub1.data,
    })
}

fn parse_full<'a>(crc: &impl FrameCrc, frame: &'a [u8]) -> Result<(Subframe<'a>, Subframe<'a>)> {
    if frame.len() < 3 {
        return Err(Error::Malformed);
    }
    let kind = CrcKind::for_data(frame[2] as usize);
    let half = frame.len() / 2;
    if frame.len() % 2 != 0 {
        return Err(Error::Malformed);
    }
    let sub1 = check_subframe(crc, kind, SUB1_SEED, &frame[..half])?;
    let sub2 = check_subframe(crc, kind, !SUB1_SEED, &frame[half..])?;
    if sub1.data != sub2.data {
        return Err(Error::Malformed);
    }
    Ok((sub1, sub2))
}

fn parse_slim<'a>(crc: &impl FrameCrc, frame: &'a [u8]) -> Result<(Subframe<'a>, Subframe<'a>)> {
    for (kind, pos) in [
        (CrcKind::Crc8, SLIM_FRAME_SUB1_POS_CRC8),
        (CrcKind::Crc16, SLIM_FRAME_SUB1_POS_CRC16),
    ] {
        let Some(&le) = frame.get(pos + 2) else {
            continue;
        };
        let le = le as usize;
        if CrcKind::for_data(le) != kind || frame.len() != pos + SUBFRAME_HEADER_LEN + le + kind.len() {
            continue;
        }
        let sub2 = check_subframe(crc, kind, !SUB1_SEED, &frame[..pos])?;
        if !sub2.data.is_empty() {
            return Err(Error::Malformed);
        }
        let sub1 = check_subframe(crc, kind, SUB1_SEED, &frame[pos..])?;
        return Ok((sub1, sub2));
    }
    Err(Error::Malformed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc::OpenSafetyCrc;
    use std::vec::Vec;

    #[derive(Default)]
    struct Capture {
        sent: Vec<Vec<u8>>,
    }

    impl Shnf for Capture {
        fn transmit(&mut self, msg: &[u8]) -> nb::Result<(), Error> {
            self.sent.push(msg.to_vec());
            Ok(())
        }
    }

    fn build(slim: bool, data: &[u8]) -> Vec<u8> {
        let mut xcom = Xcom::new(OpenSafetyCrc);
        let mut shnf = Capture::default();
        xcom.set_current_timebase(0x1122_3344_5566_7788);
        xcom.post_ssdo_snmt_frame(&mut shnf, 0x123, 5, data, slim)
            .unwrap();
        shnf.sent.remove(0)
    }

    #[test]
    fn slim_crc8_layout() {
        let msg = build(true, &[0xA0, 0xA1, 0xA2]);
        assert_eq!(&msg[..4], &[0x02, 0x01, 15, 0]);
        let frame = &msg[MESSAGE_HEADER_LEN..];
        // Header only subframe 2 first
        assert_eq!(frame[2], 0);
        assert_eq!(&frame[3..5], &[0x88, 0x77]);
        let sub1 = &frame[SLIM_FRAME_SUB1_POS_CRC8..];
        assert_eq!(&sub1[..3], &[0x23, 0x15, 3]);
        assert_eq!(&sub1[5..8], &[0xA0, 0xA1, 0xA2]);
        let crc = OpenSafetyCrc;
        assert_eq!(sub1[8], crc.crc8(0, &sub1[..8]));

        let parsed = parse(&crc, &msg).unwrap();
        assert_eq!(parsed.format, MsgFormat::SsdoSet);
        assert!(parsed.slim);
        assert_eq!(parsed.adr, 0x123);
        assert_eq!(parsed.id, 5);
        assert_eq!(parsed.timebase, 0x1122_3344_5566_7788);
        assert_eq!(parsed.data, &[0xA0, 0xA1, 0xA2]);
    }

    #[test]
    fn slim_crc16_for_long_data() {
        let data: Vec<u8> = (0..40).collect();
        let msg = build(true, &data);
        let frame = &msg[MESSAGE_HEADER_LEN..];
        let sub1 = &frame[SLIM_FRAME_SUB1_POS_CRC16..];
        assert_eq!(sub1[2] as usize, data.len());
        let covered = SUBFRAME_HEADER_LEN + data.len();
        let expected = OpenSafetyCrc.crc16(0, &sub1[..covered]);
        assert_eq!(&sub1[covered..], &expected.to_le_bytes());
        assert_eq!(parse(&OpenSafetyCrc, &msg).unwrap().data, &data[..]);
    }

    #[test]
    fn full_frame_roundtrip() {
        let mut xcom = Xcom::new(OpenSafetyCrc);
        let mut shnf = Capture::default();
        xcom.set_current_timebase(7);
        xcom.post_spdo_frame(&mut shnf, 0x3FF, 0x3F, &[1, 2, 3, 4]).unwrap();
        let msg = &shnf.sent[0];
        // 2 x (5 header + 4 data + 1 CRC8)
        assert_eq!(msg.len(), MESSAGE_HEADER_LEN + 20);
        let parsed = parse(&OpenSafetyCrc, msg).unwrap();
        assert_eq!(parsed.format, MsgFormat::SpdoSet);
        assert!(!parsed.slim);
        assert_eq!((parsed.adr, parsed.id), (0x3FF, 0x3F));
        assert_eq!(parsed.data, &[1, 2, 3, 4]);
    }

    #[test]
    fn corruption_detected() {
        for slim in [true, false] {
            for size in [3usize, 19, 20, 100] {
                let data: Vec<u8> = (0..size as u8).collect();
                let msg = build(slim, &data);
                assert!(parse(&OpenSafetyCrc, &msg).is_ok());
                // Every data byte of subframe 1
                let sub1 = if slim {
                    MESSAGE_HEADER_LEN + SUBFRAME_HEADER_LEN + CrcKind::for_data(size).len()
                } else {
                    MESSAGE_HEADER_LEN
                };
                for offset in 0..size {
                    let mut corrupted = msg.clone();
                    corrupted[sub1 + SUBFRAME_HEADER_LEN + offset] ^= 0x40;
                    assert_eq!(parse(&OpenSafetyCrc, &corrupted), Err(Error::Crc));
                }
            }
        }
    }

    #[test]
    fn stale_timebase_rejected() {
        let mut xcom = Xcom::new(OpenSafetyCrc);
        let mut shnf = Capture::default();
        assert_eq!(
            xcom.post_spdo_frame(&mut shnf, 1, 0, &[0]),
            Err(nb::Error::Other(Error::StaleTimebase))
        );
        xcom.set_current_timebase(1);
        xcom.post_spdo_frame(&mut shnf, 1, 0, &[0]).unwrap();
        // Consumed by the first build
        assert_eq!(
            xcom.post_spdo_frame(&mut shnf, 1, 0, &[0]),
            Err(nb::Error::Other(Error::StaleTimebase))
        );
        assert_eq!(shnf.sent.len(), 1);
    }

    #[test]
    fn oversized_data_rejected() {
        let mut xcom = Xcom::new(OpenSafetyCrc);
        xcom.set_current_timebase(1);
        let data = [0u8; XCOM_MAX_DATA + 1];
        assert_eq!(
            xcom.build(MsgFormat::SsdoSet, true, 1, 0, &data),
            Err(Error::PayloadTooLarge)
        );
    }
}
