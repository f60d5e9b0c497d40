//! lanspeed -- LAN throughput testing over a WebSocket control channel.
//!
//! A client opens the control socket and sends `start`; the server streams
//! one `speed` sample per interval and closes the run with a single
//! `final` carrying the average. Samples are taken by timing one payload
//! block, either pulled over the raw TCP bulk listener or pushed over the
//! control socket as binary frames.

pub mod api;
pub mod client;
pub mod config;
pub mod control;
pub mod session;
pub mod throughput;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;

use crate::api::state::AppState;
use crate::config::SpeedConfig;
use crate::control::ControlContext;
use crate::throughput::bulk::{dial_address, BulkListener};
use crate::throughput::payload::PayloadGenerator;

/// Both listeners, bound and ready to serve.
pub struct SpeedServer {
    config: SpeedConfig,
    control: TcpListener,
    bulk: BulkListener,
    generator: Arc<PayloadGenerator>,
}

impl SpeedServer {
    /// Validate `config` and bind the control and bulk listeners.
    pub async fn bind(config: SpeedConfig) -> Result<Self> {
        config.validate()?;

        let generator = Arc::new(PayloadGenerator::from_config(&config.payload));
        let control = TcpListener::bind(&config.server.control_address)
            .await
            .with_context(|| {
                format!(
                    "failed to bind control listener on {}",
                    config.server.control_address
                )
            })?;
        let bulk = BulkListener::bind(
            &config.server.bulk_address,
            Arc::clone(&generator),
            config.test.io_timeout(),
        )
        .await?;

        Ok(Self {
            config,
            control,
            bulk,
            generator,
        })
    }

    pub fn control_addr(&self) -> Result<SocketAddr> {
        self.control
            .local_addr()
            .context("failed to get control listener address")
    }

    pub fn bulk_addr(&self) -> Result<SocketAddr> {
        self.bulk.local_addr()
    }

    /// Serve until Ctrl-C.
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
        })
        .await
    }

    /// Serve until `shutdown` resolves.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let control_addr = self.control_addr()?;
        let bulk_target = dial_address(self.bulk_addr()?);

        let state = AppState::new(
            ControlContext {
                test: self.config.test.clone(),
                bulk_target,
                generator: self.generator,
            },
            self.config.server.ws_path.clone(),
        );
        let app = api::router(state);

        info!(
            addr = %control_addr,
            ws_path = %self.config.server.ws_path,
            bulk_target = %bulk_target,
            strategy = ?self.config.test.strategy,
            "lanspeed listening"
        );

        let bulk_task = self.bulk.spawn();
        let served = axum::serve(
            self.control,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await;
        bulk_task.abort();

        served.context("control server failed")
    }
}

/// Bind both listeners from `config` and serve until Ctrl-C.
pub async fn serve(config: SpeedConfig) -> Result<()> {
    SpeedServer::bind(config).await?.run().await
}
