//! SSDO transmit channel, AP to PCP to network.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::channel::{MSG_MAX_LEN, MsgFormat, Received, Receiver, Sender};
use crate::config::{SSDO_ARP_RETRY_MAX, SSDO_MAX_PAYLOAD};
use crate::ssdo::{Handoff, SsdoTransport};
use crate::tbuf::{Tbuf, TbufIo};
use crate::timeout::{TimeoutHandle, TimeoutPool, TimeoutState};
use crate::{Error, Result};

/// AP end of the transmit channel
pub struct TxProducer<I: TbufIo> {
    sender: Sender<I>,
}

impl<I: TbufIo> TxProducer<I> {
    pub fn new(tbuf: Tbuf<I>, channel: u8) -> Result<Self> {
        Ok(Self {
            sender: Sender::new(tbuf, channel)?,
        })
    }

    /// Post a frame for transmission.  Busy until the PCP finished
    /// transmitting the previous one.
    pub fn post_payload(&mut self, payload: &[u8]) -> nb::Result<(), Error> {
        if payload.len() > SSDO_MAX_PAYLOAD {
            return Err(nb::Error::Other(Error::PayloadTooLarge));
        }
        self.sender.post(MsgFormat::SsdoSet as u8, payload)?;
        Ok(())
    }

    /// Whether a new frame can be posted
    pub fn ready(&mut self) -> Result<bool> {
        self.sender.ready()
    }
}

/// State of the PCP end of the transmit channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Invalid,
    WaitForFrame,
    ProcessFrame,
    WaitForTxFinished,
    WaitForNextArpRetry,
    TxFinished,
}

/// PCP end of the transmit channel
pub struct TxConsumer<I: TbufIo> {
    receiver: Receiver<I>,
    state: TxState,
    frame: Option<Received>,
    scratch: [u8; MSG_MAX_LEN],
    arp_timer: TimeoutHandle,
    arp_retries: u8,
}

impl<I: TbufIo> TxConsumer<I> {
    /// Arguments:
    /// - `tbuf` - consumer end of the SSDO transmit buffer
    /// - `pool` - pool the address resolution retry timer is taken from
    /// - `arp_retry_cycles` - sync cycles between two handoff attempts while
    ///   the peer address is unresolved
    pub fn new(tbuf: Tbuf<I>, pool: &mut TimeoutPool, arp_retry_cycles: u32) -> Result<Self> {
        let receiver = Receiver::new(tbuf)?;
        let arp_timer = pool.create(arp_retry_cycles)?;
        Ok(Self {
            receiver,
            state: TxState::WaitForFrame,
            frame: None,
            scratch: [0; MSG_MAX_LEN],
            arp_timer,
            arp_retries: 0,
        })
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    /// Advance the state machine.
    ///
    /// Busy while a frame is in flight or its peer address unresolved.  A
    /// transport failure, or an address still unresolved after
    /// [`SSDO_ARP_RETRY_MAX`] retries, drops the frame, acknowledges it
    /// towards the AP and returns to [`TxState::WaitForFrame`].
    pub fn process(
        &mut self,
        pool: &mut TimeoutPool,
        transport: &mut impl SsdoTransport,
    ) -> nb::Result<(), Error> {
        match self.state {
            TxState::Invalid => Err(nb::Error::Other(Error::Uninit)),
            TxState::WaitForFrame => {
                let Some(msg) = self.receiver.poll(&mut self.scratch)? else {
                    return Ok(());
                };
                if msg.duplicate {
                    warn!("SSDO tx repost of seq {} dropped", msg.header.seq.value());
                    self.receiver.acknowledge(&msg)?;
                    return Ok(());
                }
                self.frame = Some(msg);
                self.set_state(TxState::ProcessFrame);
                self.hand_off(pool, transport)
            }
            TxState::ProcessFrame => self.hand_off(pool, transport),
            TxState::WaitForNextArpRetry => match pool.check_expire(self.arp_timer)? {
                TimeoutState::Expired => {
                    self.set_state(TxState::ProcessFrame);
                    self.hand_off(pool, transport)
                }
                _ => Err(nb::Error::WouldBlock),
            },
            TxState::WaitForTxFinished => Err(nb::Error::WouldBlock),
            TxState::TxFinished => {
                self.release(pool)?;
                Ok(())
            }
        }
    }

    /// Transport callback: the frame handed off was sent.
    pub fn tx_transfer_finished(&mut self) -> Result<()> {
        if self.state != TxState::WaitForTxFinished {
            warn!("SSDO tx finished in state {:?}", self.state);
            return Err(Error::InvalidOperation);
        }
        self.set_state(TxState::TxFinished);
        Ok(())
    }

    /// Count one synchronous cycle
    pub fn process_sync(&self, pool: &mut TimeoutPool) -> Result<()> {
        pool.increment(self.arp_timer)
    }

    fn hand_off(
        &mut self,
        pool: &mut TimeoutPool,
        transport: &mut impl SsdoTransport,
    ) -> nb::Result<(), Error> {
        let Some(msg) = self.frame else {
            self.set_state(TxState::WaitForFrame);
            return Ok(());
        };
        let channel = msg.header.channel;
        match transport.transmit(channel, msg.payload(&self.scratch)) {
            Ok(Handoff::Queued) => {
                pool.stop(self.arp_timer)?;
                self.set_state(TxState::WaitForTxFinished);
                Ok(())
            }
            Ok(Handoff::AddressPending) if self.arp_retries < SSDO_ARP_RETRY_MAX => {
                self.arp_retries += 1;
                debug!("SSDO tx channel {channel} address pending, retry {}", self.arp_retries);
                pool.start(self.arp_timer)?;
                self.set_state(TxState::WaitForNextArpRetry);
                Err(nb::Error::WouldBlock)
            }
            Ok(Handoff::AddressPending) => {
                error!("SSDO tx channel {channel} address unresolved, frame dropped");
                self.release(pool)?;
                Err(nb::Error::Other(Error::Transport))
            }
            Err(e) => {
                error!("SSDO tx channel {channel} transport error {e:?}");
                self.release(pool)?;
                Err(nb::Error::Other(e))
            }
        }
    }

    // Acknowledge the current frame and wait for the next one
    fn release(&mut self, pool: &mut TimeoutPool) -> Result<()> {
        if let Some(msg) = self.frame.take() {
            self.receiver.acknowledge(&msg)?;
        }
        self.arp_retries = 0;
        pool.stop(self.arp_timer)?;
        self.set_state(TxState::WaitForFrame);
        Ok(())
    }

    fn set_state(&mut self, state: TxState) {
        trace!("SSDO tx {:?} -> {state:?}", self.state);
        self.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::HEADER_LEN;
    use crate::channel::testing::{memory, tbuf_pair};
    use crate::config::BufferId;
    use std::vec::Vec;

    const SIZE: usize = HEADER_LEN + 32;

    #[derive(Default)]
    struct Transport {
        sent: Vec<(u8, Vec<u8>)>,
        pending: u8,
        fail: bool,
    }

    impl SsdoTransport for Transport {
        fn transmit(&mut self, channel: u8, payload: &[u8]) -> Result<Handoff> {
            if self.fail {
                return Err(Error::Transport);
            }
            if self.pending > 0 {
                self.pending -= 1;
                return Ok(Handoff::AddressPending);
            }
            self.sent.push((channel, payload.to_vec()));
            Ok(Handoff::Queued)
        }
    }

    #[test]
    fn busy_until_transfer_finished() {
        let mem = memory();
        let (producer, consumer) = tbuf_pair(&mem, BufferId::SsdoTx, SIZE);
        let mut pool = TimeoutPool::new();
        let mut ap = TxProducer::new(producer, 2).unwrap();
        let mut pcp = TxConsumer::new(consumer, &mut pool, 5).unwrap();
        let mut transport = Transport::default();

        ap.post_payload(b"request").unwrap();
        assert_eq!(ap.post_payload(b"next"), Err(nb::Error::WouldBlock));

        pcp.process(&mut pool, &mut transport).unwrap();
        assert_eq!(pcp.state(), TxState::WaitForTxFinished);
        for _ in 0..10 {
            assert_eq!(pcp.process(&mut pool, &mut transport), Err(nb::Error::WouldBlock));
        }
        assert_eq!(transport.sent, [(2, b"request".to_vec())]);
        assert!(!ap.ready().unwrap());

        pcp.tx_transfer_finished().unwrap();
        assert_eq!(pcp.state(), TxState::TxFinished);
        assert_eq!(pcp.tx_transfer_finished(), Err(Error::InvalidOperation));
        pcp.process(&mut pool, &mut transport).unwrap();
        assert_eq!(pcp.state(), TxState::WaitForFrame);
        assert!(ap.ready().unwrap());

        ap.post_payload(b"next").unwrap();
        pcp.process(&mut pool, &mut transport).unwrap();
        assert_eq!(transport.sent.len(), 2);
    }

    #[test]
    fn address_resolution_retried_on_timer() {
        let mem = memory();
        let (producer, consumer) = tbuf_pair(&mem, BufferId::SsdoTx, SIZE);
        let mut pool = TimeoutPool::new();
        let mut ap = TxProducer::new(producer, 0).unwrap();
        let mut pcp = TxConsumer::new(consumer, &mut pool, 3).unwrap();
        let mut transport = Transport {
            pending: 1,
            ..Default::default()
        };

        ap.post_payload(b"frame").unwrap();
        assert_eq!(pcp.process(&mut pool, &mut transport), Err(nb::Error::WouldBlock));
        assert_eq!(pcp.state(), TxState::WaitForNextArpRetry);

        // Timer not yet expired
        pcp.process_sync(&mut pool).unwrap();
        pcp.process_sync(&mut pool).unwrap();
        assert_eq!(pcp.process(&mut pool, &mut transport), Err(nb::Error::WouldBlock));
        assert!(transport.sent.is_empty());

        pcp.process_sync(&mut pool).unwrap();
        pcp.process(&mut pool, &mut transport).unwrap();
        assert_eq!(pcp.state(), TxState::WaitForTxFinished);
        assert_eq!(transport.sent.len(), 1);
    }

    #[test]
    fn unresolved_address_drops_frame() {
        let mem = memory();
        let (producer, consumer) = tbuf_pair(&mem, BufferId::SsdoTx, SIZE);
        let mut pool = TimeoutPool::new();
        let mut ap = TxProducer::new(producer, 0).unwrap();
        let mut pcp = TxConsumer::new(consumer, &mut pool, 1).unwrap();
        let mut transport = Transport {
            pending: u8::MAX,
            ..Default::default()
        };

        ap.post_payload(b"frame").unwrap();
        let mut result = pcp.process(&mut pool, &mut transport);
        for _ in 0..SSDO_ARP_RETRY_MAX {
            assert_eq!(result, Err(nb::Error::WouldBlock));
            pcp.process_sync(&mut pool).unwrap();
            result = pcp.process(&mut pool, &mut transport);
        }
        assert_eq!(result, Err(nb::Error::Other(Error::Transport)));
        assert_eq!(pcp.state(), TxState::WaitForFrame);
        // Frame released towards the AP
        assert!(ap.ready().unwrap());
    }

    #[test]
    fn transport_error_resets_channel() {
        let mem = memory();
        let (producer, consumer) = tbuf_pair(&mem, BufferId::SsdoTx, SIZE);
        let mut pool = TimeoutPool::new();
        let mut ap = TxProducer::new(producer, 0).unwrap();
        let mut pcp = TxConsumer::new(consumer, &mut pool, 1).unwrap();
        let mut transport = Transport {
            fail: true,
            ..Default::default()
        };

        ap.post_payload(b"frame").unwrap();
        assert_eq!(
            pcp.process(&mut pool, &mut transport),
            Err(nb::Error::Other(Error::Transport))
        );
        assert_eq!(pcp.state(), TxState::WaitForFrame);
        assert!(ap.ready().unwrap());
    }
}
