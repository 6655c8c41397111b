//! WebSocket Connector
//!
//! `tokio-tungstenite` backed socket. Binary frames are accepted when they
//! hold UTF-8 text; control frames never reach the connection manager.

use std::borrow::Cow;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::traits::{FrameSocket, SocketConnector, SocketFrame, TransportError};

/// Opens websocket connections
#[derive(Clone, Copy, Debug, Default)]
pub struct WsConnector;

/// An open websocket
pub struct WsSocket {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl SocketConnector for WsConnector {
    type Socket = WsSocket;

    async fn connect(&self, url: &str) -> Result<Self::Socket, TransportError> {
        let (inner, response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        tracing::debug!(url, status = %response.status(), "Websocket handshake complete");
        Ok(WsSocket { inner })
    }
}

#[async_trait]
impl FrameSocket for WsSocket {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.inner
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<SocketFrame, TransportError>> {
        loop {
            let message = match self.inner.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(TransportError::ReceiveFailed(e.to_string()))),
            };

            match message {
                Message::Text(text) => return Some(Ok(SocketFrame::Text(text))),
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(SocketFrame::Text(text))),
                    Err(e) => tracing::warn!(error = %e, "Dropping non-UTF-8 binary frame"),
                },
                Message::Close(frame) => {
                    let (code, reason) = match frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.into_owned()),
                        None => (None, String::new()),
                    };
                    return Some(Ok(SocketFrame::Close { code, reason }));
                }
                // tungstenite queues the pong reply itself
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: Cow::Owned(reason.to_string()),
        };
        self.inner
            .close(Some(frame))
            .await
            .map_err(|e| TransportError::CloseFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_refused() {
        // Port 1 on loopback is never listening in test environments
        let result = WsConnector.connect("ws://127.0.0.1:1/ws").await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    }
}
