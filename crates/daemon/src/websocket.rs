//! WebSocket message adaptation

use futures::future::{self, Ready};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

use signalcraft_relay::{Frame, TransportError};

pub fn frame_to_message(frame: Frame) -> Message {
    match frame {
        Frame::Binary(data) => Message::Binary(data),
        Frame::Text(text) => Message::Text(text),
        Frame::Ping(data) => Message::Ping(data),
        Frame::Pong(data) => Message::Pong(data),
        Frame::Close(code) => Message::Close(code.map(|code| CloseFrame {
            code: WsCloseCode::from(code),
            reason: "".into(),
        })),
    }
}

/// `None` for raw frames, which never surface from a read
pub fn message_to_frame(message: Message) -> Option<Frame> {
    match message {
        Message::Binary(data) => Some(Frame::Binary(data)),
        Message::Text(text) => Some(Frame::Text(text)),
        Message::Ping(data) => Some(Frame::Ping(data)),
        Message::Pong(data) => Some(Frame::Pong(data)),
        Message::Close(close) => Some(Frame::Close(close.map(|c| u16::from(c.code)))),
        Message::Frame(_) => None,
    }
}

fn transport_error(err: WsError) -> TransportError {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
        WsError::Capacity(e) => TransportError::TooLarge(e.to_string()),
        other => TransportError::Failure(other.to_string()),
    }
}

fn read_frame(item: Result<Message, WsError>) -> Ready<Option<Result<Frame, TransportError>>> {
    future::ready(match item {
        Ok(message) => message_to_frame(message).map(Ok),
        Err(err) => Some(Err(transport_error(err))),
    })
}

fn write_frame(frame: Frame) -> Ready<Result<Message, TransportError>> {
    future::ready(Ok(frame_to_message(frame)))
}

/// Split an upgraded socket into the relay's frame sink and stream
pub fn split_socket<S>(
    socket: WebSocketStream<S>,
) -> (
    impl Sink<Frame, Error = TransportError> + Unpin,
    impl Stream<Item = Result<Frame, TransportError>> + Unpin,
)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (sink, stream) = socket.split();
    let sink = sink.sink_map_err(transport_error).with(write_frame);
    let stream = stream.filter_map(read_frame);
    (sink, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::error::CapacityError;

    #[test]
    fn test_binary_passthrough() {
        let data = vec![0u8, 1, 2, 255];
        let message = frame_to_message(Frame::Binary(data.clone()));
        assert_eq!(message, Message::Binary(data.clone()));
        assert_eq!(message_to_frame(message), Some(Frame::Binary(data)));
    }

    #[test]
    fn test_close_code_carried() {
        let message = frame_to_message(Frame::Close(Some(3001)));
        match &message {
            Message::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), 3001);
                assert!(frame.reason.is_empty());
            }
            other => panic!("unexpected message {:?}", other),
        }
        assert_eq!(message_to_frame(message), Some(Frame::Close(Some(3001))));
    }

    #[test]
    fn test_bare_close() {
        assert_eq!(frame_to_message(Frame::Close(None)), Message::Close(None));
        assert_eq!(message_to_frame(Message::Close(None)), Some(Frame::Close(None)));
    }

    #[test]
    fn test_ping_pong() {
        assert_eq!(
            message_to_frame(Message::Ping(vec![9])),
            Some(Frame::Ping(vec![9]))
        );
        assert_eq!(frame_to_message(Frame::Pong(vec![9])), Message::Pong(vec![9]));
    }

    // ==================== NEGATIVE TESTS ====================

    #[test]
    fn test_closed_socket_maps_to_closed() {
        assert!(matches!(
            transport_error(WsError::ConnectionClosed),
            TransportError::Closed
        ));
        assert!(matches!(
            transport_error(WsError::Utf8),
            TransportError::Failure(_)
        ));
    }

    #[test]
    fn test_capacity_maps_to_too_large() {
        let err = WsError::Capacity(CapacityError::MessageTooLong {
            size: 1024,
            max_size: 256,
        });
        assert!(matches!(transport_error(err), TransportError::TooLarge(_)));
    }
}
