//! Raw TCP bulk-transfer channel.
//!
//! The listener side writes exactly one generated payload block to every
//! accepted connection and then closes it. The measuring side dials in,
//! drains to end-of-stream and times the transfer.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::payload::PayloadGenerator;
use super::sampler::Sample;
use super::{Measure, ThroughputError};

/// Read buffer used while draining a block.
const READ_BUF_SIZE: usize = 64 * 1024;

/// Back-off after a failed accept so a persistent error (fd exhaustion)
/// does not spin the accept loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// BulkListener
// ---------------------------------------------------------------------------

/// Serves one payload block per accepted connection.
pub struct BulkListener {
    listener: TcpListener,
    generator: Arc<PayloadGenerator>,
    write_timeout: Duration,
}

impl BulkListener {
    /// Bind the bulk listener on `addr`.
    pub async fn bind(
        addr: &str,
        generator: Arc<PayloadGenerator>,
        write_timeout: Duration,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind bulk listener on {}", addr))?;
        Ok(Self {
            listener,
            generator,
            write_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("failed to get bulk listener address")
    }

    /// Accept connections forever. Accept errors are logged and skipped.
    pub async fn run(self) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(addr = %addr, chunk_size = self.generator.size(), "bulk listener ready");
        }

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!(error = %e, "failed to accept bulk connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            let generator = Arc::clone(&self.generator);
            let write_timeout = self.write_timeout;
            tokio::spawn(async move {
                match serve_block(stream, &generator, write_timeout).await {
                    Ok(bytes) => debug!(peer_addr = %peer_addr, bytes = bytes, "bulk block sent"),
                    Err(e) => warn!(peer_addr = %peer_addr, error = %e, "bulk block not delivered"),
                }
            });
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

/// Write one block to `stream` under `write_timeout`, then close it.
async fn serve_block(
    mut stream: TcpStream,
    generator: &Arc<PayloadGenerator>,
    write_timeout: Duration,
) -> Result<u64, ThroughputError> {
    // A failed generation drops the connection without sending anything.
    let block = generator.generate_blocking().await?;

    timeout(write_timeout, async {
        stream.write_all(&block).await?;
        stream.shutdown().await
    })
    .await
    .map_err(|_| ThroughputError::Timeout {
        what: "bulk write",
        after: write_timeout,
    })??;

    Ok(block.len() as u64)
}

// ---------------------------------------------------------------------------
// PullMeasure
// ---------------------------------------------------------------------------

/// Pull-based sampling: dial the bulk listener and time draining one block.
#[derive(Debug, Clone)]
pub struct PullMeasure {
    target: SocketAddr,
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl PullMeasure {
    pub fn new(target: SocketAddr, connect_timeout: Duration, io_timeout: Duration) -> Self {
        Self {
            target,
            connect_timeout,
            io_timeout,
        }
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }
}

#[async_trait::async_trait]
impl Measure for PullMeasure {
    async fn sample(&self, cancel: &CancellationToken) -> Result<Sample, ThroughputError> {
        let connect = timeout(self.connect_timeout, TcpStream::connect(self.target));
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ThroughputError::Cancelled),
            res = connect => res.map_err(|_| ThroughputError::Timeout {
                what: "bulk connect",
                after: self.connect_timeout,
            })??,
        };

        // The sender starts writing as soon as it accepts.
        let start = Instant::now();
        let bytes = timeout(self.io_timeout, drain(&mut stream, cancel))
            .await
            .map_err(|_| ThroughputError::Timeout {
                what: "bulk read",
                after: self.io_timeout,
            })??;
        let elapsed = start.elapsed();

        if bytes == 0 {
            return Err(ThroughputError::EmptyTransfer);
        }

        let sample = Sample::new(bytes, elapsed);
        debug!(
            target_addr = %self.target,
            bytes = bytes,
            elapsed_ms = elapsed.as_millis() as u64,
            speed_mbps = sample.mbps,
            "pull sample taken"
        );
        Ok(sample)
    }
}

/// Read `reader` until end-of-stream, returning the number of bytes seen.
pub async fn drain<R>(reader: &mut R, cancel: &CancellationToken) -> Result<u64, ThroughputError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut total: u64 = 0;
    loop {
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ThroughputError::Cancelled),
            res = reader.read(&mut buf) => res?,
        };
        if n == 0 {
            return Ok(total);
        }
        total += n as u64;
    }
}

/// Address to dial for a listener bound on `bind`. Wildcard binds are
/// reached through loopback.
pub fn dial_address(bind: SocketAddr) -> SocketAddr {
    let ip = match bind.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    SocketAddr::new(ip, bind.port())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
