use std::time::Duration;

use bytes::{Buf, BytesMut};
use log::{debug, warn};
use oflb_common::ofp::{Header, Message, OFP_HEADER_LEN};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::error::ChannelError;

const READ_CHUNK: usize = 4096;

/// Framed OpenFlow connection.
///
/// Both directions go through internal buffers, so [`Channel::read_frame`]
/// and [`Channel::recv`] are cancel safe and can sit in a `tokio::select!`.
/// Outbound frames are queued whole and drained with `write_buf`; a drain
/// cut short resumes where it stopped on the next send or receive.
pub struct Channel<S> {
    stream: S,
    rbuf: BytesMut,
    wbuf: BytesMut,
    next_xid: u32,
    timeout: Duration,
}

impl<S> Channel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, timeout: Duration) -> Self {
        Channel {
            stream,
            rbuf: BytesMut::with_capacity(READ_CHUNK),
            wbuf: BytesMut::new(),
            next_xid: 1,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn allocate_xid(&mut self) -> u32 {
        let xid = self.next_xid;
        self.next_xid = self.next_xid.checked_add(1).unwrap_or(1);
        xid
    }

    /// Bytes queued for the switch but not yet written.
    pub fn pending(&self) -> usize {
        self.wbuf.remaining()
    }

    fn queue(&mut self, xid: u32, msg: &Message) -> Result<(), ChannelError> {
        let frame = msg.encode(xid)?;
        self.wbuf.extend_from_slice(&frame);
        Ok(())
    }

    async fn flush_pending(&mut self) -> Result<(), ChannelError> {
        while self.wbuf.has_remaining() {
            if self.stream.write_buf(&mut self.wbuf).await? == 0 {
                return Err(ChannelError::Closed);
            }
        }
        self.stream.flush().await?;
        Ok(())
    }

    /// Sends `msg` under a fresh transaction id and returns that id.
    pub async fn send(&mut self, msg: &Message) -> Result<u32, ChannelError> {
        let xid = self.allocate_xid();
        self.send_xid(xid, msg).await?;
        Ok(xid)
    }

    /// Queues `msg` behind anything still pending and drains the queue.
    pub async fn send_xid(&mut self, xid: u32, msg: &Message) -> Result<(), ChannelError> {
        self.queue(xid, msg)?;
        timeout(self.timeout, self.flush_pending())
            .await
            .map_err(|_| ChannelError::Timeout("write to switch"))?
    }

    fn take_frame(&mut self) -> Result<Option<(Header, Message)>, ChannelError> {
        if self.rbuf.len() < OFP_HEADER_LEN {
            return Ok(None);
        }
        let mut head = [0u8; OFP_HEADER_LEN];
        head.copy_from_slice(&self.rbuf[..OFP_HEADER_LEN]);
        let header = Header::parse(&head);
        let total = OFP_HEADER_LEN + header.body_len()?;
        if self.rbuf.len() < total {
            return Ok(None);
        }
        let frame = self.rbuf.split_to(total).freeze();
        let msg = Message::decode(&header, &frame[OFP_HEADER_LEN..])?;
        Ok(Some((header, msg)))
    }

    /// Next frame off the wire, whatever its type.
    pub async fn read_frame(&mut self) -> Result<(Header, Message), ChannelError> {
        loop {
            if let Some(frame) = self.take_frame()? {
                return Ok(frame);
            }
            self.rbuf.reserve(READ_CHUNK);
            if self.stream.read_buf(&mut self.rbuf).await? == 0 {
                return Err(ChannelError::Closed);
            }
        }
    }

    /// Next frame the session has to act on. Echo requests are answered and
    /// unsolicited asynchronous messages are dropped here.
    ///
    /// Echo replies are queued, then drained before the next read.
    pub async fn recv(&mut self) -> Result<(Header, Message), ChannelError> {
        loop {
            self.flush_pending().await?;
            let (header, msg) = self.read_frame().await?;
            match msg {
                Message::EchoRequest(data) => {
                    self.queue(header.xid, &Message::EchoReply(data))?;
                }
                Message::Other { msg_type, .. } => {
                    debug!("ignoring message type {} xid {}", msg_type, header.xid);
                }
                Message::FlowMod(_) | Message::GroupMod(_) | Message::FeaturesRequest => {
                    warn!(
                        "switch sent controller-only message type {}",
                        header.msg_type
                    );
                }
                msg => return Ok((header, msg)),
            }
        }
    }

    /// [`Channel::recv`] bounded by the channel timeout.
    pub async fn recv_timeout(
        &mut self,
        what: &'static str,
    ) -> Result<(Header, Message), ChannelError> {
        timeout(self.timeout, self.recv())
            .await
            .map_err(|_| ChannelError::Timeout(what))?
    }
}
