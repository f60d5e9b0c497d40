//! Throughput measurement: payload generation, sample timing, the bulk
//! transfer channel and the per-run test driver.

pub mod bulk;
pub mod driver;
pub mod payload;
pub mod push;
pub mod report;
pub mod sampler;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::{Strategy, TestConfig};
use crate::control::outbox::Outbox;

use self::bulk::PullMeasure;
use self::payload::PayloadGenerator;
use self::push::PushMeasure;
use self::sampler::Sample;

/// Failures that end a sample, and with it the current run.
#[derive(Debug, Error)]
pub enum ThroughputError {
    #[error("bulk channel I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("control channel write failed: {0}")]
    Transport(String),

    #[error("control channel is closed")]
    ChannelClosed,

    #[error("payload generation failed: {0}")]
    Generation(String),

    #[error("{what} timed out after {after:?}")]
    Timeout { what: &'static str, after: Duration },

    #[error("bulk transfer ended before any payload arrived")]
    EmptyTransfer,

    #[error("run cancelled")]
    Cancelled,
}

/// One way of taking a throughput sample.
///
/// Implementations must observe `cancel` while blocked on I/O and return
/// [`ThroughputError::Cancelled`] promptly when it fires.
#[async_trait::async_trait]
pub trait Measure: Send + Sync {
    async fn sample(&self, cancel: &CancellationToken) -> Result<Sample, ThroughputError>;
}

/// Build the measurement strategy for one control connection.
///
/// The push strategy writes into the connection's own outbox, so each
/// connection gets its own instance.
pub fn measure_for(
    test: &TestConfig,
    bulk_target: SocketAddr,
    generator: &Arc<PayloadGenerator>,
    outbox: &Outbox,
) -> Arc<dyn Measure> {
    match test.strategy {
        Strategy::Pull => Arc::new(PullMeasure::new(
            bulk_target,
            test.connect_timeout(),
            test.io_timeout(),
        )),
        Strategy::Push => Arc::new(PushMeasure::new(
            Arc::clone(generator),
            outbox.clone(),
            test.io_timeout(),
        )),
    }
}
