use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use lanspeed::client::{ClientEvent, SpeedClient};
use lanspeed::config::{LogFormat, LoggingConfig, SpeedConfig, Strategy};
use lanspeed::throughput::bulk::PullMeasure;
use lanspeed::throughput::report::{format_speed, format_summary, RunSummary};
use lanspeed::throughput::Measure;

#[derive(Parser)]
#[command(
    name = "lanspeed",
    about = "LAN throughput tester with a WebSocket control channel",
    version,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server (control socket + bulk listener)
    Serve {
        /// Path to a TOML config file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Control channel bind address (overrides config)
        #[arg(long)]
        addr: Option<String>,

        /// Bulk listener bind address (overrides config)
        #[arg(long)]
        test_addr: Option<String>,

        /// Payload block size in bytes (overrides config)
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Measurement strategy: pull or push (overrides config)
        #[arg(long)]
        strategy: Option<String>,
    },

    /// Run one test against a server and print the samples
    Client {
        /// Control channel URL
        #[arg(long, env = "LANSPEED_URL", default_value = "ws://127.0.0.1:8080/ws")]
        url: String,

        /// Test duration in seconds (server default when omitted)
        #[arg(long)]
        duration: Option<u64>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Pull blocks straight from a bulk listener, without a control channel
    Probe {
        /// Bulk listener address
        #[arg(long, default_value = "127.0.0.1:3001")]
        addr: String,

        /// Number of blocks to pull
        #[arg(long, default_value = "1")]
        count: u32,

        /// Connect timeout in seconds
        #[arg(long, default_value = "5")]
        connect_timeout: u64,

        /// Per-block read timeout in seconds
        #[arg(long, default_value = "10")]
        io_timeout: u64,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            addr,
            test_addr,
            chunk_size,
            strategy,
        } => {
            let mut cfg = SpeedConfig::resolve(config.as_deref())?;
            if let Some(addr) = addr {
                cfg.server.control_address = addr;
            }
            if let Some(addr) = test_addr {
                cfg.server.bulk_address = addr;
            }
            if let Some(size) = chunk_size {
                cfg.payload.chunk_size = size;
            }
            if let Some(strategy) = strategy {
                cfg.test.strategy = parse_strategy(&strategy)?;
            }

            init_tracing(&cfg.logging);
            tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting lanspeed server");
            lanspeed::serve(cfg).await?;
        }
        Commands::Client {
            url,
            duration,
            json,
        } => {
            init_tracing(&LoggingConfig {
                level: "warn".to_string(),
                ..LoggingConfig::default()
            });
            let summary = run_client(&url, duration, json).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("{}", format_summary(&summary));
            }
        }
        Commands::Probe {
            addr,
            count,
            connect_timeout,
            io_timeout,
        } => {
            init_tracing(&LoggingConfig {
                level: "warn".to_string(),
                ..LoggingConfig::default()
            });
            run_probe(&addr, count, connect_timeout, io_timeout).await?;
        }
    }

    Ok(())
}

fn parse_strategy(s: &str) -> Result<Strategy> {
    match s {
        "pull" => Ok(Strategy::Pull),
        "push" => Ok(Strategy::Push),
        other => anyhow::bail!("unknown strategy '{}', expected pull or push", other),
    }
}

/// Run one test. The first Ctrl-C sends `stop` and waits for the `final`.
async fn run_client(url: &str, duration: Option<u64>, quiet: bool) -> Result<RunSummary> {
    let mut client = SpeedClient::connect(url, Duration::from_secs(10))
        .await
        .with_context(|| format!("failed to connect to {}", url))?;
    client.start(duration).await?;

    let mut summary = RunSummary::default();
    let mut stopping = false;
    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c(), if !stopping => {
                stopping = true;
                client.stop().await?;
                continue;
            }
            event = client.next_event() => event?,
        };

        match event {
            Some(ClientEvent::Speed(speed)) => {
                if !quiet {
                    println!("{:>4}  {}", summary.samples.len() + 1, format_speed(speed));
                }
                summary.samples.push(speed);
            }
            Some(ClientEvent::Final(average)) => {
                summary.average = average;
                break;
            }
            None => anyhow::bail!("server closed the connection before the final result"),
        }
    }

    client.close().await?;
    Ok(summary)
}

async fn run_probe(addr: &str, count: u32, connect_timeout: u64, io_timeout: u64) -> Result<()> {
    let target = tokio::net::lookup_host(addr)
        .await
        .with_context(|| format!("failed to resolve {}", addr))?
        .next()
        .with_context(|| format!("no address found for {}", addr))?;
    let measure = PullMeasure::new(
        target,
        Duration::from_secs(connect_timeout),
        Duration::from_secs(io_timeout),
    );

    let cancel = CancellationToken::new();
    let mut summary = RunSummary::default();
    for n in 1..=count {
        let sample = measure
            .sample(&cancel)
            .await
            .with_context(|| format!("probe {} against {} failed", n, target))?;
        println!(
            "{:>4}  {} bytes in {:.3}s  {}",
            n,
            sample.bytes,
            sample.elapsed.as_secs_f64(),
            format_speed(sample.mbps)
        );
        summary.samples.push(sample.mbps);
    }
    summary.average = lanspeed::session::mean(&summary.samples);
    println!("{}", format_summary(&summary));
    Ok(())
}
