// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

mod common;

use psi::Error;
use psi::channel::{HEADER_LEN, MsgHeader};
use psi::config::{BufferId, SSDO_MAX_PAYLOAD, TIMEOUT_MAX_INSTANCES, TbufDescriptor};
use psi::ssdo::{IncomingFrame, RxConsumer, RxProducer, RxState, SsdoHandler};
use psi::tbuf::{SliceTbufIo, Tbuf, TbufRole, region_size};
use psi::timeout::{TimeoutPool, TimeoutState};

use common::{BASE, memory};

#[derive(Default)]
struct Delivered {
    frames: Vec<Vec<u8>>,
}

impl SsdoHandler for Delivered {
    fn ssdo_received(&mut self, _channel: u8, payload: &[u8]) {
        self.frames.push(payload.to_vec());
    }
}

#[test]
fn process_images_cross_in_both_directions() {
    let mem = memory(64);
    let io = SliceTbufIo::new(&mem, BASE);
    let rpdo = TbufDescriptor::new(BufferId::Rpdo, BASE, 8);
    let tpdo = TbufDescriptor::new(BufferId::Tpdo, BASE + region_size(8) as u32, 16);

    // PCP produces the RPDO image and consumes the TPDO image
    let mut pcp_rpdo = Tbuf::create(io, TbufRole::Producer, &rpdo).unwrap();
    let mut pcp_tpdo = Tbuf::create(io, TbufRole::Consumer, &tpdo).unwrap();
    let mut ap_rpdo = Tbuf::attach(io, TbufRole::Consumer, &rpdo).unwrap();
    let mut ap_tpdo = Tbuf::attach(io, TbufRole::Producer, &tpdo).unwrap();

    let out = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];
    let seq = pcp_rpdo.write(&out).unwrap();
    let mut buf = [0u8; 8];
    let snap = ap_rpdo.read(&mut buf).unwrap();
    assert_eq!(snap.seq, seq);
    assert!(snap.fresh);
    assert_eq!(buf, out);

    let back: Vec<u8> = (0..16).map(|i| 0xF0 ^ i).collect();
    let first = ap_tpdo.write(&back).unwrap();
    let mut buf = [0u8; 16];
    let snap = pcp_tpdo.read(&mut buf).unwrap();
    assert_eq!(snap.seq, first);
    assert_eq!(snap.len, 16);
    assert_eq!(&buf[..], &back[..]);

    // Reading again without a write is not fresh
    assert!(!pcp_tpdo.read(&mut buf).unwrap().fresh);

    let second = ap_tpdo.write(&back).unwrap();
    assert_ne!(second, first);
    let snap = pcp_tpdo.read(&mut buf).unwrap();
    assert!(snap.fresh);
    assert_eq!(snap.seq, second);
}

#[test]
fn ssdo_retransmission_reposts_identical_bytes_once() {
    let size = HEADER_LEN + SSDO_MAX_PAYLOAD;
    let mem = memory(region_size(size) / 4);
    let io = SliceTbufIo::new(&mem, BASE);
    let desc = TbufDescriptor::new(BufferId::SsdoRx, BASE, size);
    let mut pool = TimeoutPool::new();

    let mut pcp = RxProducer::new(
        Tbuf::create(io, TbufRole::Producer, &desc).unwrap(),
        2,
        &mut pool,
        50,
    )
    .unwrap();
    let mut ap = RxConsumer::new(Tbuf::attach(io, TbufRole::Consumer, &desc).unwrap()).unwrap();
    // Second consumer watching the raw buffer
    let mut spy = Tbuf::attach(io, TbufRole::Consumer, &desc).unwrap();
    let mut handler = Delivered::default();

    let payload = [0x2A, 0x00, 0x10, 0x01, 0xDE, 0xAD];
    pcp.handle_incoming(&IncomingFrame {
        seq: 9,
        retry: false,
        payload: &payload,
    })
    .unwrap();
    pcp.process(&mut pool).unwrap();
    assert_eq!(pcp.state(), RxState::WaitForAck);

    let mut original = [0u8; HEADER_LEN + SSDO_MAX_PAYLOAD];
    let first = spy.read(&mut original).unwrap();
    assert_eq!(first.len, HEADER_LEN + payload.len());

    assert_eq!(ap.process(&mut handler), Ok(true));
    pcp.process(&mut pool).unwrap();
    assert_eq!(pcp.state(), RxState::WaitForFrame);
    assert_eq!(pcp.queued(), 0);
    assert_eq!(pcp.last_acked(), Some(&payload[..]));

    // The peer missed the response and asks for seq 9 again
    pcp.handle_incoming(&IncomingFrame {
        seq: 9,
        retry: true,
        payload: &[],
    })
    .unwrap();
    assert_eq!(pcp.state(), RxState::RepostFrame);
    pcp.process(&mut pool).unwrap();
    assert_eq!(pcp.state(), RxState::WaitForAck);

    let mut repost = [0u8; HEADER_LEN + SSDO_MAX_PAYLOAD];
    let second = spy.read(&mut repost).unwrap();
    assert!(second.fresh);
    assert_ne!(second.seq, first.seq);
    assert_eq!(second.len, first.len);

    let original_header = MsgHeader::decode(&original[..first.len]).unwrap();
    let repost_header = MsgHeader::decode(&repost[..second.len]).unwrap();
    assert!(!original_header.retry);
    assert!(repost_header.retry);
    assert_eq!(repost_header.seq, original_header.seq);
    assert_eq!(repost[0], original[0] | 0x80);
    assert_eq!(repost[1..second.len], original[1..first.len]);
    assert_eq!(repost[HEADER_LEN..second.len], payload);

    // Acknowledged without a second delivery
    assert_eq!(ap.process(&mut handler), Ok(false));
    pcp.process(&mut pool).unwrap();
    assert_eq!(pcp.state(), RxState::WaitForFrame);
    assert_eq!(handler.frames, [payload.to_vec()]);

    // Next frame is delivered normally
    pcp.handle_incoming(&IncomingFrame {
        seq: 10,
        retry: false,
        payload: &[1, 2, 3],
    })
    .unwrap();
    pcp.process(&mut pool).unwrap();
    assert_eq!(ap.process(&mut handler), Ok(true));
    assert_eq!(handler.frames.len(), 2);
}

#[test]
fn timeout_pool_exhaustion_leaves_existing_timers_intact() {
    let mut pool = TimeoutPool::new();
    let handles: Vec<_> = (0..TIMEOUT_MAX_INSTANCES)
        .map(|i| pool.create(i as u32 + 1).unwrap())
        .collect();
    assert_eq!(pool.available(), 0);
    assert_eq!(pool.create(5), Err(Error::PoolExhausted));

    for handle in &handles {
        pool.start(*handle).unwrap();
    }
    for _ in 0..TIMEOUT_MAX_INSTANCES {
        for handle in &handles {
            assert_ne!(pool.check_expire(*handle).unwrap(), TimeoutState::Stopped);
            pool.increment(*handle).unwrap();
        }
    }
    for handle in &handles {
        assert_eq!(pool.check_expire(*handle), Ok(TimeoutState::Expired));
    }

    // A freed instance is available again
    pool.destroy(handles[0]).unwrap();
    let reused = pool.create(1).unwrap();
    assert_eq!(pool.check_expire(reused), Ok(TimeoutState::Stopped));
    assert_eq!(pool.create(1), Err(Error::PoolExhausted));
}
