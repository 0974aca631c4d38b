//! The duplex stream a client is attached through.
//!
//! The hub never sees sockets directly. Anything that is both a `Stream` of inbound
//! frames and a `Sink` of outbound frames can carry a connection: the web layer wraps
//! a WebSocket, in-process clients and tests use [`ChannelTransport`].

use crate::error::{Error, ErrorKind, Result, TransportErrorKind};
use futures::channel::mpsc;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};

/// One discrete unit read from or written to a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

pub trait Transport:
    Stream<Item = Result<Frame>> + Sink<Frame, Error = Error> + Send + Unpin + 'static
{
}

impl<T> Transport for T where
    T: Stream<Item = Result<Frame>> + Sink<Frame, Error = Error> + Send + Unpin + 'static
{
}

/// In-memory transport backed by a pair of bounded channels.
pub struct ChannelTransport {
    incoming: mpsc::Receiver<Result<Frame>>,
    outgoing: mpsc::Sender<Frame>,
}

/// The client side of a [`ChannelTransport`].
pub struct ChannelPeer {
    to_hub: mpsc::Sender<Result<Frame>>,
    from_hub: mpsc::Receiver<Frame>,
}

impl ChannelTransport {
    pub fn pair(capacity: usize) -> (ChannelTransport, ChannelPeer) {
        let (to_hub, incoming) = mpsc::channel(capacity);
        let (outgoing, from_hub) = mpsc::channel(capacity);
        (
            ChannelTransport { incoming, outgoing },
            ChannelPeer { to_hub, from_hub },
        )
    }
}

impl ChannelPeer {
    pub async fn send(&mut self, frame: Frame) -> Result<()> {
        self.to_hub
            .send(Ok(frame))
            .await
            .map_err(|e| Error::with_source(ErrorKind::Transport(TransportErrorKind::Closed), e))
    }

    pub async fn send_data(&mut self, payload: impl Into<Vec<u8>>) -> Result<()> {
        self.send(Frame::Data(payload.into())).await
    }

    /// Injects a transport failure into the hub's read side.
    pub async fn fail(&mut self, kind: TransportErrorKind) -> Result<()> {
        self.to_hub
            .send(Err(Error::transport(kind)))
            .await
            .map_err(|e| Error::with_source(ErrorKind::Transport(TransportErrorKind::Closed), e))
    }

    /// Next frame written by the hub, `None` once the hub released the transport.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.from_hub.next().await
    }

    /// Next data payload written by the hub, skipping liveness pings.
    pub async fn recv_data(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.recv().await? {
                Frame::Data(payload) => return Some(payload),
                Frame::Close => return None,
                Frame::Ping(_) | Frame::Pong(_) => continue,
            }
        }
    }

    /// Hangs up from the client side.
    pub fn disconnect(&mut self) {
        self.to_hub.close_channel();
    }
}

impl Stream for ChannelTransport {
    type Item = Result<Frame>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.incoming).poll_next(cx)
    }
}

impl Sink<Frame> for ChannelTransport {
    type Error = Error;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        Pin::new(&mut self.outgoing).poll_ready(cx).map_err(write_error)
    }

    fn start_send(mut self: Pin<&mut Self>, item: Frame) -> Result<()> {
        Pin::new(&mut self.outgoing).start_send(item).map_err(write_error)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        Pin::new(&mut self.outgoing).poll_flush(cx).map_err(write_error)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        Pin::new(&mut self.outgoing).poll_close(cx).map_err(write_error)
    }
}

fn write_error(err: mpsc::SendError) -> Error {
    Error::with_source(ErrorKind::Transport(TransportErrorKind::Write), err)
}
