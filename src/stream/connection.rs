//! Single WebSocket stream connection
//!
//! Thin wrapper around one depth stream socket. `next_text` hides the
//! frame-level protocol from the reader task: control frames are handled
//! in place (server pings answered in kind) and only data payloads come
//! back. Any terminal condition drops the socket and surfaces as an error.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::{MonitorError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One depth stream connection
pub struct StreamConnection {
    stream: Option<WsStream>,
    url: String,
}

impl StreamConnection {
    pub fn new(url: String) -> Self {
        Self { stream: None, url }
    }

    /// Open the socket
    pub async fn connect(&mut self) -> Result<()> {
        let (stream, response) = connect_async(&self.url).await.map_err(|e| {
            MonitorError::WebSocketConnection(format!("connect to {} failed: {e}", self.url))
        })?;

        info!(url = %self.url, status = response.status().as_u16(), "Depth stream open");
        self.stream = Some(stream);
        Ok(())
    }

    /// Read until the next data payload. Server pings are answered with a
    /// pong inline; pong and raw frames are skipped. A close frame, a
    /// transport error or stream exhaustion drops the socket and returns
    /// the reason as an error.
    pub async fn next_text(&mut self) -> Result<String> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(MonitorError::WebSocketConnection("no open stream".to_string()));
        };

        let reason = loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text.to_string()),
                Some(Ok(Message::Binary(raw))) => {
                    return Ok(String::from_utf8_lossy(&raw).into_owned())
                }
                Some(Ok(Message::Ping(payload))) => {
                    debug!("Answering server ping");
                    if let Err(e) = stream.send(Message::Pong(payload)).await {
                        break MonitorError::WebSocketMessage(format!("pong failed: {e}"));
                    }
                }
                Some(Ok(Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    break MonitorError::WebSocketConnection(match frame {
                        Some(close) => format!("closed by server: {}", close.reason),
                        None => "closed by server".to_string(),
                    });
                }
                Some(Err(e)) => break MonitorError::WebSocketMessage(e.to_string()),
                None => {
                    break MonitorError::WebSocketConnection("stream exhausted".to_string())
                }
            }
        };

        self.stream = None;
        warn!(url = %self.url, error = %reason, "Depth stream lost");
        Err(reason)
    }

    /// Send a client keep-alive ping
    pub async fn ping(&mut self) -> Result<()> {
        match self.stream.as_mut() {
            Some(stream) => stream
                .send(Message::Ping(Vec::new().into()))
                .await
                .map_err(|e| MonitorError::WebSocketMessage(e.to_string())),
            None => Err(MonitorError::WebSocketConnection("no open stream".to_string())),
        }
    }

    /// Close handshake, tolerating a socket that is already gone
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.close(None).await {
                debug!(url = %self.url, error = %e, "Close handshake failed");
            }
        }
    }
}
