//! Send-serialization point for one control connection.
//!
//! A single task owns the write half of the channel. Everybody else
//! (the driver loop, the stop handler, push-based sampling) enqueues
//! frames through a cloned [`Outbox`], so frames hit the wire one at a
//! time and in enqueue order. Each enqueue returns a [`Delivery`] that
//! resolves once the frame has been written, carrying the write time.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::throughput::ThroughputError;

use super::rpc::{self, ServerMessage};

/// One outbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

/// Write half of a control channel.
#[async_trait::async_trait]
pub trait FrameSink: Send {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), ThroughputError>;

    async fn close(&mut self) -> Result<(), ThroughputError>;
}

struct Outbound {
    frame: Frame,
    ack: oneshot::Sender<Result<Duration, ThroughputError>>,
}

/// Pending write of one frame.
#[must_use = "a delivery reports transport failures only when awaited"]
pub struct Delivery {
    rx: oneshot::Receiver<Result<Duration, ThroughputError>>,
}

impl Delivery {
    /// Wait until the frame is written. Returns how long the write took.
    pub async fn wait(self) -> Result<Duration, ThroughputError> {
        self.rx.await.map_err(|_| ThroughputError::ChannelClosed)?
    }
}

/// Cloneable handle to a connection's send task.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Outbox {
    /// Start the send task for `sink`.
    ///
    /// The task exits after the first failed write, or once every
    /// `Outbox` clone has been dropped, closing the sink on the way out.
    pub fn spawn<S>(sink: S) -> (Self, JoinHandle<()>)
    where
        S: FrameSink + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_send_task(sink, rx));
        (Self { tx }, task)
    }

    /// Queue a frame without waiting for it to be written.
    ///
    /// Never blocks, so it is safe to call while holding the session lock.
    pub fn enqueue(&self, frame: Frame) -> Result<Delivery, ThroughputError> {
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(Outbound { frame, ack })
            .map_err(|_| ThroughputError::ChannelClosed)?;
        Ok(Delivery { rx })
    }

    /// Queue a JSON control message.
    pub fn enqueue_message(&self, msg: &ServerMessage) -> Result<Delivery, ThroughputError> {
        let text = rpc::encode_server(msg)
            .map_err(|e| ThroughputError::Transport(format!("failed to encode message: {}", e)))?;
        self.enqueue(Frame::Text(text))
    }

    /// Whether the send task is still accepting frames.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

async fn run_send_task<S: FrameSink>(mut sink: S, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(Outbound { frame, ack }) = rx.recv().await {
        let started = Instant::now();
        let result = sink.send_frame(frame).await.map(|_| started.elapsed());
        let failed = result.is_err();
        if let Err(e) = &result {
            warn!(error = %e, "control channel write failed, closing send task");
        }
        // The sender may have stopped waiting (cancelled run); that is fine.
        let _ = ack.send(result);
        if failed {
            break;
        }
    }

    // Queued frames behind a failure resolve as ChannelClosed.
    drop(rx);
    if let Err(e) = sink.close().await {
        debug!(error = %e, "control channel close failed");
    }
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------

/// A sink that forwards frames to an in-memory channel.
#[cfg(test)]
pub(crate) struct ChannelSink {
    tx: mpsc::UnboundedSender<Frame>,
    fail_after: Option<usize>,
    sent: usize,
}

#[cfg(test)]
impl ChannelSink {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                fail_after: None,
                sent: 0,
            },
            rx,
        )
    }

    /// Fail every write after the first `n` succeed.
    pub(crate) fn failing_after(n: usize) -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (mut sink, rx) = Self::new();
        sink.fail_after = Some(n);
        (sink, rx)
    }
}

#[cfg(test)]
#[async_trait::async_trait]
impl FrameSink for ChannelSink {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), ThroughputError> {
        if matches!(self.fail_after, Some(n) if self.sent >= n) {
            return Err(ThroughputError::Transport("broken pipe".into()));
        }
        self.sent += 1;
        self.tx.send(frame).map_err(|_| ThroughputError::ChannelClosed)
    }

    async fn close(&mut self) -> Result<(), ThroughputError> {
        Ok(())
    }
}

/// Decode a text frame produced by the server.
#[cfg(test)]
pub(crate) fn decode_frame(frame: &Frame) -> Option<ServerMessage> {
    match frame {
        Frame::Text(text) => serde_json::from_str(text).ok(),
        Frame::Binary(_) => None,
    }
}
