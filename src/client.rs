//! Control channel client.
//!
//! Used by the `client` subcommand and the end-to-end tests. Binary frames
//! (push-mode payload) are counted and otherwise skipped.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::control::rpc::{ClientMessage, ServerMessage};
use crate::throughput::report::RunSummary;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("failed to encode control message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("connecting to {url} timed out after {after:?}")]
    ConnectTimeout { url: String, after: Duration },

    #[error("server closed the control channel before the run finished")]
    Closed,
}

/// A report received from the server.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClientEvent {
    Speed(f64),
    Final(f64),
}

pub struct SpeedClient {
    ws: WsStream,
    binary_bytes: u64,
}

impl SpeedClient {
    pub async fn connect(url: &str, connect_timeout: Duration) -> Result<Self, ClientError> {
        let (ws, _response) = timeout(connect_timeout, connect_async(url))
            .await
            .map_err(|_| ClientError::ConnectTimeout {
                url: url.to_string(),
                after: connect_timeout,
            })??;
        debug!(url = %url, "control channel connected");
        Ok(Self {
            ws,
            binary_bytes: 0,
        })
    }

    pub async fn start(&mut self, duration: Option<u64>) -> Result<(), ClientError> {
        self.send(&ClientMessage::Start { duration }).await
    }

    pub async fn stop(&mut self) -> Result<(), ClientError> {
        self.send(&ClientMessage::Stop).await
    }

    /// Send a raw text frame, bypassing message encoding.
    pub async fn send_raw(&mut self, text: &str) -> Result<(), ClientError> {
        self.ws.send(Message::text(text)).await?;
        Ok(())
    }

    async fn send(&mut self, msg: &ClientMessage) -> Result<(), ClientError> {
        let text = serde_json::to_string(msg)?;
        self.send_raw(&text).await
    }

    /// Next `speed` or `final`. `None` once the server has closed.
    pub async fn next_event(&mut self) -> Result<Option<ClientEvent>, ClientError> {
        while let Some(msg) = self.ws.next().await {
            match msg? {
                Message::Text(text) => match serde_json::from_str::<ServerMessage>(text.as_str()) {
                    Ok(ServerMessage::Speed { speed }) => return Ok(Some(ClientEvent::Speed(speed))),
                    Ok(ServerMessage::Final { average }) => {
                        return Ok(Some(ClientEvent::Final(average)))
                    }
                    Err(e) => warn!(error = %e, "skipping unrecognized server message"),
                },
                Message::Binary(data) => self.binary_bytes += data.len() as u64,
                Message::Close(_) => break,
                _ => {}
            }
        }
        Ok(None)
    }

    /// Collect reports until the run's `final`.
    pub async fn run_to_final(&mut self) -> Result<RunSummary, ClientError> {
        let mut summary = RunSummary::default();
        loop {
            match self.next_event().await? {
                Some(ClientEvent::Speed(speed)) => summary.samples.push(speed),
                Some(ClientEvent::Final(average)) => {
                    summary.average = average;
                    return Ok(summary);
                }
                None => return Err(ClientError::Closed),
            }
        }
    }

    /// Payload bytes received as binary frames so far.
    pub fn binary_bytes(&self) -> u64 {
        self.binary_bytes
    }

    pub async fn close(mut self) -> Result<(), ClientError> {
        self.ws.close(None).await?;
        Ok(())
    }
}
