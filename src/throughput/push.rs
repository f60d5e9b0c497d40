//! Push-based sampling over the control channel itself.
//!
//! Each block goes out as a binary frame through the connection's outbox.
//! The send task times the write of that frame alone, so the sample does
//! not include time spent queued behind other frames.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::control::outbox::{Frame, Outbox};

use super::payload::PayloadGenerator;
use super::sampler::Sample;
use super::{Measure, ThroughputError};

pub struct PushMeasure {
    generator: Arc<PayloadGenerator>,
    outbox: Outbox,
    io_timeout: Duration,
}

impl PushMeasure {
    pub fn new(generator: Arc<PayloadGenerator>, outbox: Outbox, io_timeout: Duration) -> Self {
        Self {
            generator,
            outbox,
            io_timeout,
        }
    }
}

#[async_trait::async_trait]
impl Measure for PushMeasure {
    async fn sample(&self, cancel: &CancellationToken) -> Result<Sample, ThroughputError> {
        let block = self.generator.generate_blocking().await?;
        let bytes = block.len() as u64;

        let delivery = self.outbox.enqueue(Frame::Binary(block))?;
        let elapsed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ThroughputError::Cancelled),
            res = timeout(self.io_timeout, delivery.wait()) => res.map_err(|_| ThroughputError::Timeout {
                what: "push write",
                after: self.io_timeout,
            })??,
        };

        let sample = Sample::new(bytes, elapsed);
        debug!(
            bytes = bytes,
            elapsed_ms = elapsed.as_millis() as u64,
            speed_mbps = sample.mbps,
            "push sample taken"
        );
        Ok(sample)
    }
}
