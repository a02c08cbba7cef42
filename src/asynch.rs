//! Asynchronous message channels.
//!
//! One buffer per direction (`AsyncTx` from the AP, `AsyncRx` to the AP)
//! carries xcom messages for any number of logical channels.  The channel
//! header names the logical channel and the message format; the receiver
//! routes each message to the handler its [`AsyncRoutes`] name for that
//! channel.
//!
//! Messages are validated with [`xcom::parse()`] before delivery, so a
//! handler only ever sees frames whose CRCs matched.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use heapless::Vec;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::channel::{MSG_MAX_LEN, MsgFormat, Receiver, Sender};
use crate::config::ASYNC_MAX_CHANNELS;
use crate::crc::FrameCrc;
use crate::tbuf::{Tbuf, TbufIo};
use crate::xcom::{self, Shnf, XcomFrame};
use crate::{Error, Result};

/// Receive handler collaborator
pub trait AsyncHandler {
    /// Called exactly once per message received on a registered channel
    fn async_received(&mut self, channel: u8, frame: &XcomFrame<'_>);
}

/// Receive handler table, one handler per logical channel
pub trait AsyncRoutes {
    /// Handler for `channel`, or `None` if nothing serves it
    fn handler(&mut self, channel: u8) -> Option<&mut dyn AsyncHandler>;
}

/// A lone handler serves every registered channel
impl<H: AsyncHandler> AsyncRoutes for H {
    fn handler(&mut self, _channel: u8) -> Option<&mut dyn AsyncHandler> {
        Some(self)
    }
}

/// Producing end of an async buffer
pub struct AsyncSender<I: TbufIo> {
    sender: Sender<I>,
}

impl<I: TbufIo> AsyncSender<I> {
    pub fn new(tbuf: Tbuf<I>, channel: u8) -> Result<Self> {
        Ok(Self {
            sender: Sender::new(tbuf, channel)?,
        })
    }

    /// Post an xcom message.  Busy until the previous one was acknowledged.
    pub fn post(&mut self, format: MsgFormat, msg: &[u8]) -> nb::Result<(), Error> {
        self.sender.post(format as u8, msg)?;
        Ok(())
    }

    pub fn ready(&mut self) -> Result<bool> {
        self.sender.ready()
    }

    /// Address the following posts to logical `channel`
    pub fn set_channel(&mut self, channel: u8) {
        self.sender.set_channel(channel);
    }
}

impl<I: TbufIo> Shnf for AsyncSender<I> {
    fn transmit(&mut self, msg: &[u8]) -> nb::Result<(), Error> {
        let format = MsgFormat::try_from(*msg.first().ok_or(Error::Malformed)?)?;
        self.post(format, msg)
    }
}

/// Consuming end of an async buffer
pub struct AsyncReceiver<I: TbufIo> {
    receiver: Receiver<I>,
    channels: Vec<u8, ASYNC_MAX_CHANNELS>,
    scratch: [u8; MSG_MAX_LEN],
}

impl<I: TbufIo> AsyncReceiver<I> {
    pub fn new(tbuf: Tbuf<I>) -> Result<Self> {
        Ok(Self {
            receiver: Receiver::new(tbuf)?,
            channels: Vec::new(),
            scratch: [0; MSG_MAX_LEN],
        })
    }

    /// Accept messages for `channel` from now on
    pub fn register(&mut self, channel: u8) -> Result<()> {
        if self.channels.contains(&channel) {
            return Ok(());
        }
        self.channels
            .push(channel)
            .map_err(|_| Error::PoolExhausted)?;
        debug!("Async channel {channel} registered");
        Ok(())
    }

    /// Validate a fresh message and hand it to the handler `routes` names
    /// for its channel.
    ///
    /// Returns whether a handler was invoked.  Messages for unregistered or
    /// unrouted channels, with bad CRCs or a malformed layout are
    /// acknowledged, dropped and reported.
    pub fn process(
        &mut self,
        crc: &impl FrameCrc,
        routes: &mut impl AsyncRoutes,
    ) -> nb::Result<bool, Error> {
        let Some(msg) = self.receiver.poll(&mut self.scratch)? else {
            return Ok(false);
        };
        if msg.duplicate {
            trace!("Async repost of seq {} acknowledged", msg.header.seq.value());
            self.receiver.acknowledge(&msg)?;
            return Ok(false);
        }

        let channel = msg.header.channel;
        let handler = if self.channels.contains(&channel) {
            routes.handler(channel)
        } else {
            None
        };
        let result = match handler {
            None => {
                warn!("Async message for unknown channel {channel}");
                Err(Error::UnknownChannel(channel))
            }
            Some(handler) => match xcom::parse(crc, msg.payload(&self.scratch)) {
                Ok(frame) if frame.format as u8 == msg.header.format => {
                    handler.async_received(channel, &frame);
                    Ok(true)
                }
                Ok(_) => Err(Error::Malformed),
                Err(e) => {
                    warn!("Async message on channel {channel} dropped: {e:?}");
                    Err(e)
                }
            },
        };
        self.receiver.acknowledge(&msg)?;
        Ok(result?)
    }
}
