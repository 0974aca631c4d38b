use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures::{ready, Sink, Stream};
use hub::error::{Error, ErrorKind, Result, TransportErrorKind};
use hub::transport::Frame;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Carries a hub connection over an upgraded axum WebSocket.
pub(crate) struct WsTransport {
    socket: WebSocket,
}

impl WsTransport {
    pub(crate) fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

impl Stream for WsTransport {
    type Item = Result<Frame>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let next = match ready!(Pin::new(&mut self.socket).poll_next(cx)) {
            Some(Ok(message)) => Some(Ok(frame_from_message(message))),
            Some(Err(e)) => Some(Err(Error::with_source(
                ErrorKind::Transport(TransportErrorKind::Read),
                e,
            ))),
            None => None,
        };
        Poll::Ready(next)
    }
}

impl Sink<Frame> for WsTransport {
    type Error = Error;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        Pin::new(&mut self.socket).poll_ready(cx).map_err(write_error)
    }

    fn start_send(mut self: Pin<&mut Self>, frame: Frame) -> Result<()> {
        Pin::new(&mut self.socket)
            .start_send(message_from_frame(frame))
            .map_err(write_error)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        Pin::new(&mut self.socket).poll_flush(cx).map_err(write_error)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        Pin::new(&mut self.socket).poll_close(cx).map_err(write_error)
    }
}

fn frame_from_message(message: Message) -> Frame {
    match message {
        Message::Text(text) => Frame::Data(text.into_bytes()),
        Message::Binary(data) => Frame::Data(data),
        Message::Ping(data) => Frame::Ping(data),
        Message::Pong(data) => Frame::Pong(data),
        Message::Close(_) => Frame::Close,
    }
}

/// Payloads go out as text frames whenever they are valid UTF-8.
fn message_from_frame(frame: Frame) -> Message {
    match frame {
        Frame::Data(data) => match String::from_utf8(data) {
            Ok(text) => Message::Text(text),
            Err(e) => Message::Binary(e.into_bytes()),
        },
        Frame::Ping(data) => Message::Ping(data),
        Frame::Pong(data) => Message::Pong(data),
        Frame::Close => Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: "".into(),
        })),
    }
}

fn write_error(err: axum::Error) -> Error {
    Error::with_source(ErrorKind::Transport(TransportErrorKind::Write), err)
}
