//! Payload generator for timed transfers.
//!
//! Block content does not affect the measurement, only its size does. The
//! default fill is OS entropy so nothing on the path can compress it.

use std::sync::Arc;

use bytes::Bytes;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::config::{PayloadConfig, PayloadFill};

use super::ThroughputError;

/// Produces fixed-size payload blocks.
#[derive(Debug, Clone)]
pub struct PayloadGenerator {
    size: usize,
    fill: PayloadFill,
    zeroes: Bytes,
}

impl PayloadGenerator {
    pub fn new(size: usize, fill: PayloadFill) -> Self {
        // The zero block is shared across samples; `Bytes` clones are cheap.
        let zeroes = match fill {
            PayloadFill::Zero => Bytes::from(vec![0u8; size]),
            PayloadFill::Random => Bytes::new(),
        };
        Self { size, fill, zeroes }
    }

    pub fn from_config(config: &PayloadConfig) -> Self {
        Self::new(config.chunk_size, config.fill)
    }

    /// Block size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Generate one block.
    pub fn generate(&self) -> Result<Bytes, ThroughputError> {
        match self.fill {
            PayloadFill::Random => fill_from(&mut OsRng, self.size),
            PayloadFill::Zero => Ok(self.zeroes.clone()),
        }
    }

    /// Generate one block on the blocking pool. Filling several megabytes
    /// from the entropy source should not stall a runtime worker.
    pub async fn generate_blocking(self: &Arc<Self>) -> Result<Bytes, ThroughputError> {
        let generator = Arc::clone(self);
        tokio::task::spawn_blocking(move || generator.generate())
            .await
            .map_err(|e| ThroughputError::Generation(format!("generator task failed: {}", e)))?
    }
}

/// Fill a `size`-byte block from `rng`. Never returns a partial block.
fn fill_from<R: RngCore>(rng: &mut R, size: usize) -> Result<Bytes, ThroughputError> {
    let mut buf = vec![0u8; size];
    rng.try_fill_bytes(&mut buf)
        .map_err(|e| ThroughputError::Generation(e.to_string()))?;
    Ok(Bytes::from(buf))
}
