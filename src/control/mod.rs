//! Control channel: one handler per WebSocket connection.
//!
//! The read loop decodes `start`/`stop` commands and drives the
//! connection's [`Session`]. Driver loops run as separate tasks and are
//! joined before a new run starts and on teardown. Every write goes
//! through the connection's [`Outbox`].

pub mod outbox;
pub mod rpc;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TestConfig;
use crate::session::Session;
use crate::throughput::driver::{DriverSettings, RunHandle, TestDriver};
use crate::throughput::payload::PayloadGenerator;
use crate::throughput::{self, Measure, ThroughputError};

use self::outbox::{Delivery, Frame, FrameSink, Outbox};
use self::rpc::{ClientMessage, ServerMessage};

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Per-connection command handling, independent of the socket type.
pub struct Connection {
    conn_id: Uuid,
    session: Arc<Session>,
    outbox: Outbox,
    measure: Arc<dyn Measure>,
    test: TestConfig,
    run: Option<RunHandle>,
}

impl Connection {
    pub fn new(conn_id: Uuid, test: TestConfig, outbox: Outbox, measure: Arc<dyn Measure>) -> Self {
        Self {
            conn_id,
            session: Arc::new(Session::new()),
            outbox,
            measure,
            test,
            run: None,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Handle one inbound text frame.
    ///
    /// Malformed frames and unknown types are dropped. An error means the
    /// control channel can no longer be written and the connection should
    /// be torn down.
    pub async fn handle_text(&mut self, text: &str) -> Result<(), ThroughputError> {
        let msg = match rpc::decode_client(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(conn_id = %self.conn_id, error = %e, "dropping malformed control frame");
                return Ok(());
            }
        };

        match msg {
            ClientMessage::Start { duration } => self.start(duration).await,
            ClientMessage::Stop => self.stop().await,
            ClientMessage::Unknown => {
                debug!(conn_id = %self.conn_id, "ignoring control message of unknown type");
                Ok(())
            }
        }
    }

    async fn start(&mut self, requested: Option<u64>) -> Result<(), ThroughputError> {
        let duration = self.test.run_duration(requested);

        let mut superseded = None;
        let ticket = self
            .session
            .start_and(|c| {
                superseded = Some(
                    self.outbox
                        .enqueue_message(&ServerMessage::Final { average: c.average }),
                );
            })
            .await;

        // The old ticket is cancelled; its loop exits within one step.
        if let Some(previous) = self.run.take() {
            previous.join().await;
        }
        if let Some(queued) = superseded {
            self.wait_written(queued?).await?;
        }

        info!(
            conn_id = %self.conn_id,
            run_id = ticket.run_id,
            duration_sec = duration.as_secs(),
            "starting test run"
        );
        let driver = TestDriver::new(
            Arc::clone(&self.session),
            self.outbox.clone(),
            Arc::clone(&self.measure),
            DriverSettings::from_config(&self.test),
        );
        self.run = Some(driver.spawn(ticket, duration));
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), ThroughputError> {
        let mut queued = None;
        let stopped = self
            .session
            .stop_and(|c| {
                queued = Some(
                    self.outbox
                        .enqueue_message(&ServerMessage::Final { average: c.average }),
                );
            })
            .await;

        match stopped {
            Some(c) => info!(
                conn_id = %self.conn_id,
                run_id = c.run_id,
                samples = c.samples,
                average_mbps = c.average,
                "test run stopped by client"
            ),
            None => debug!(conn_id = %self.conn_id, "stop with no active run"),
        }

        if let Some(queued) = queued {
            self.wait_written(queued?).await?;
        }
        Ok(())
    }

    async fn wait_written(&self, delivery: Delivery) -> Result<(), ThroughputError> {
        let limit = self.test.io_timeout();
        timeout(limit, delivery.wait())
            .await
            .map_err(|_| ThroughputError::Timeout {
                what: "control write",
                after: limit,
            })?
            .map(|_| ())
    }

    /// Stop any run without reporting it and wait for its loop to exit.
    pub async fn shutdown(mut self) {
        if let Some(c) = self.session.stop().await {
            debug!(conn_id = %self.conn_id, run_id = c.run_id, "run dropped with connection");
        }
        if let Some(run) = self.run.take() {
            run.join().await;
        }
    }
}

// ---------------------------------------------------------------------------
// WebSocket adapter
// ---------------------------------------------------------------------------

/// Write half of an axum WebSocket.
pub struct WsSink(SplitSink<WebSocket, Message>);

#[async_trait::async_trait]
impl FrameSink for WsSink {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), ThroughputError> {
        let msg = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(bytes) => Message::Binary(bytes),
        };
        self.0
            .send(msg)
            .await
            .map_err(|e| ThroughputError::Transport(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), ThroughputError> {
        self.0
            .close()
            .await
            .map_err(|e| ThroughputError::Transport(e.to_string()))
    }
}

/// Everything a connection needs from the server, shared read-only.
#[derive(Clone)]
pub struct ControlContext {
    pub test: TestConfig,
    pub bulk_target: SocketAddr,
    pub generator: Arc<PayloadGenerator>,
}

/// Drive one upgraded WebSocket until the peer goes away.
pub async fn serve_socket(socket: WebSocket, ctx: ControlContext, peer: Option<SocketAddr>) {
    let conn_id = Uuid::new_v4();
    info!(conn_id = %conn_id, peer = ?peer, "control connection opened");

    let (sink, mut stream) = socket.split();
    let (outbox, send_task) = Outbox::spawn(WsSink(sink));
    let measure = throughput::measure_for(&ctx.test, ctx.bulk_target, &ctx.generator, &outbox);
    let mut conn = Connection::new(conn_id, ctx.test.clone(), outbox, measure);

    while let Some(msg) = stream.next().await {
        let result = match msg {
            Ok(Message::Text(text)) => conn.handle_text(text.as_str()).await,
            Ok(Message::Close(_)) => break,
            // Pings are answered by axum; client binary frames carry nothing.
            Ok(_) => Ok(()),
            Err(e) => {
                debug!(conn_id = %conn_id, error = %e, "control channel read failed");
                break;
            }
        };
        if let Err(e) = result {
            warn!(conn_id = %conn_id, error = %e, "control channel unusable, closing");
            break;
        }
    }

    // Dropping the connection releases the last outbox handles, which lets
    // the send task close the socket and exit.
    conn.shutdown().await;
    if timeout(Duration::from_secs(5), send_task).await.is_err() {
        debug!(conn_id = %conn_id, "send task did not exit in time");
    }
    info!(conn_id = %conn_id, "control connection closed");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
