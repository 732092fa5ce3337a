//! Stripeflow demo node
//!
//! Runs the placement engine on in-memory maps and a RAM device, drives an
//! overwrite-heavy workload so garbage collection has work, and exposes
//! health and Prometheus endpoints.
//!
//! ```text
//! ┌──────────────┐     ┌──────────────────┐     ┌──────────────────┐
//! │   Workload   │────▶│  StorageEngine   │────▶│   MemoryDevice   │
//! │  (blocking)  │     │  + GC copier     │     │                  │
//! └──────────────┘     └────────┬─────────┘     └──────────────────┘
//!                               │ events, metrics
//!                               ▼
//!                   GC loop ── /metrics, /healthz
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use stripeflow::{Allocation, EngineAdapters, EngineConfig, EngineMetrics, StorageEngine};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Stripeflow - log-structured stripe placement and garbage collection
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file (defaults apply when omitted)
    #[arg(long, env = "STRIPEFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Blocks per demo volume
    #[arg(long, env = "VOLUME_BLOCKS", default_value = "4096")]
    volume_blocks: u64,

    /// Number of demo volumes
    #[arg(long, env = "VOLUMES", default_value = "2")]
    volumes: u32,

    /// Stop after this many seconds (0 runs until Ctrl-C)
    #[arg(long, env = "RUN_SECONDS", default_value = "0")]
    run_seconds: u64,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::default(),
    };

    info!("Starting stripeflow");
    info!("  Geometry: {:?}", config.geometry);
    info!(
        "  GC thresholds: normal {} urgent {}",
        config.gc.normal_threshold, config.gc.urgent_threshold
    );
    info!("  Volumes: {} x {} blocks", args.volumes, args.volume_blocks);

    let block_size = config.geometry.block_size;
    let engine = Arc::new(
        StorageEngine::new(config, EngineAdapters::in_memory(block_size))
            .context("building storage engine")?,
    );
    for volume_id in 0..args.volumes {
        engine
            .create_volume(volume_id, args.volume_blocks)
            .with_context(|| format!("creating volume {}", volume_id))?;
    }

    let cancel = CancellationToken::new();

    engine.gc().start();
    let gc_loop = tokio::spawn(Arc::clone(engine.gc()).run(cancel.clone()));

    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {:#}", e);
        }
    });

    let metrics_addr = args.metrics_addr.clone();
    let metrics = Arc::clone(engine.metrics());
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics).await {
            error!("Metrics server error: {:#}", e);
        }
    });

    let workload = {
        let engine = Arc::clone(&engine);
        let cancel = cancel.clone();
        let volumes = args.volumes;
        let size = args.volume_blocks;
        tokio::task::spawn_blocking(move || run_workload(&engine, volumes, size, &cancel))
    };

    if args.run_seconds > 0 {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(args.run_seconds)) => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    } else {
        tokio::signal::ctrl_c()
            .await
            .context("waiting for Ctrl-C")?;
    }

    info!("Shutting down");
    cancel.cancel();
    let written = workload.await.context("workload task")?;
    info!("Workload wrote {} blocks", written);

    let stopping = Arc::clone(&engine);
    tokio::task::spawn_blocking(move || stopping.shutdown(Duration::from_secs(10)))
        .await
        .context("engine shutdown")?;
    gc_loop.await.context("GC loop")?;

    let status = engine.gc().status();
    info!(
        "GC reclaimed {} victims, copied {} blocks",
        status.stats.victims_reclaimed, status.stats.copied_blocks
    );
    Ok(())
}

// =============================================================================
// Workload
// =============================================================================

/// Overwrite pseudo-random runs until cancelled. Returns blocks written.
fn run_workload(engine: &StorageEngine, volumes: u32, size: u64, cancel: &CancellationToken) -> u64 {
    let block_size = engine.address_info().block_size();
    let mut seed: u64 = 0x9e37_79b9_7f4a_7c15;
    let mut written = 0u64;

    while !cancel.is_cancelled() {
        seed = seed
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        let volume_id = ((seed >> 33) % volumes.max(1) as u64) as u32;
        let blocks = 1 + (seed >> 20) % 8;
        let rba = (seed >> 8) % size.saturating_sub(blocks).max(1);
        let data = vec![(seed & 0xff) as u8; blocks as usize * block_size];

        match engine.write_blocks(volume_id, rba, &data) {
            Ok(Allocation::Granted(n)) => written += n as u64,
            Ok(denied) => {
                debug!("Write to volume {} {}, backing off", volume_id, denied);
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(e) => {
                warn!("Write to volume {} failed: {}", volume_id, e);
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }
    written
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

// =============================================================================
// HTTP Servers
// =============================================================================

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str) -> anyhow::Result<()> {
    async fn health_handler(
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        let response = match req.uri().path() {
            "/healthz" | "/livez" | "/readyz" => text_response(StatusCode::OK, "ok"),
            _ => text_response(StatusCode::NOT_FOUND, "not found"),
        };
        Ok(response)
    }

    let addr: SocketAddr = addr.parse().context("invalid health server address")?;
    let listener = TcpListener::bind(addr)
        .await
        .context("failed to bind health server")?;
    info!("Health server listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await.context("health server accept")?;
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(health_handler))
                .await
            {
                error!("Health server connection error: {}", e);
            }
        });
    }
}

async fn run_metrics_server(addr: &str, metrics: Arc<EngineMetrics>) -> anyhow::Result<()> {
    let addr: SocketAddr = addr.parse().context("invalid metrics server address")?;
    let listener = TcpListener::bind(addr)
        .await
        .context("failed to bind metrics server")?;
    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await.context("metrics server accept")?;
        let io = TokioIo::new(stream);
        let metrics = Arc::clone(&metrics);

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let metrics = Arc::clone(&metrics);
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => {
                            metrics.refresh();
                            match metrics.gather_text() {
                                Ok(text) => text_response(StatusCode::OK, text),
                                Err(e) => text_response(
                                    StatusCode::INTERNAL_SERVER_ERROR,
                                    e.to_string(),
                                ),
                            }
                        }
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, Infallible>(response)
                }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Metrics server connection error: {}", e);
            }
        });
    }
}
