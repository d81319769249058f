//! Transport seam between [`super::GatewayConnection`] and the network.
//!
//! The connection only sees a sink of [`Outbound`] frames and a stream of
//! [`Inbound`] frames, so tests can drive it with in-memory channels.

use futures_util::future::{self, BoxFuture};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt;
use std::pin::Pin;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    /// Close with code 1000.
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Close(Option<u16>),
}

#[derive(Debug)]
pub enum SocketError {
    Connect(String),
    Send(String),
    Receive(String),
}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketError::Connect(e) => write!(f, "connect failed: {e}"),
            SocketError::Send(e) => write!(f, "send failed: {e}"),
            SocketError::Receive(e) => write!(f, "receive failed: {e}"),
        }
    }
}

impl std::error::Error for SocketError {}

pub type FrameSink = Pin<Box<dyn Sink<Outbound, Error = SocketError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Inbound, SocketError>> + Send>>;

/// Opens upstream sockets. One call per connection attempt.
pub trait SocketFactory: Send + Sync {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<(FrameSink, FrameStream), SocketError>>;
}

/// Real WebSocket transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteFactory;

impl SocketFactory for TungsteniteFactory {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<(FrameSink, FrameStream), SocketError>> {
        let url = url.to_string();
        Box::pin(async move {
            let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| SocketError::Connect(e.to_string()))?;
            let (ws_sink, ws_stream) = ws.split();

            let sink = ws_sink
                .with(|frame: Outbound| {
                    future::ready(Ok::<_, tokio_tungstenite::tungstenite::Error>(to_message(
                        frame,
                    )))
                })
                .sink_map_err(|e| SocketError::Send(e.to_string()));

            let stream = ws_stream.filter_map(|msg| {
                future::ready(match msg {
                    Ok(Message::Text(text)) => Some(Ok(Inbound::Text(text.as_str().to_owned()))),
                    Ok(Message::Close(frame)) => {
                        Some(Ok(Inbound::Close(frame.map(|f| u16::from(f.code)))))
                    }
                    Ok(_) => None,
                    Err(e) => Some(Err(SocketError::Receive(e.to_string()))),
                })
            });

            let sink: FrameSink = Box::pin(sink);
            let stream: FrameStream = Box::pin(stream);
            Ok((sink, stream))
        })
    }
}

fn to_message(frame: Outbound) -> Message {
    match frame {
        Outbound::Text(text) => Message::Text(text.into()),
        Outbound::Close => Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_uses_normal_closure() {
        match to_message(Outbound::Close) {
            Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1000),
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[test]
    fn test_text_passthrough() {
        match to_message(Outbound::Text("hi".to_string())) {
            Message::Text(text) => assert_eq!(text.as_str(), "hi"),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connect_refused_is_connect_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = TungsteniteFactory.connect(&format!("ws://{addr}/ws")).await;
        assert!(matches!(result, Err(SocketError::Connect(_))));
    }
}
