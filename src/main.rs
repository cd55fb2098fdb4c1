use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use futures::future::join_all;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fleetrate::config::{FleetrateConfig, LoggingConfig};
use fleetrate::ratelimit::{DistributedRateLimiter, LimiterOptions};
use fleetrate::store::{self, StateStore};

/// Drive a shared rate limiter from several concurrent workers.
#[derive(Debug, Parser)]
#[command(name = "fleetrate", version, about)]
struct Args {
    /// Configuration file (YAML or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Limiter key shared with other processes
    #[arg(short, long, default_value = "fleetrate-probe")]
    key: String,

    /// Permits per second for the key
    #[arg(short, long, default_value_t = 4.0)]
    rate: f64,

    /// Requests issued by each worker
    #[arg(short = 'n', long, default_value_t = 10)]
    requests: u32,

    /// Concurrent workers
    #[arg(short, long, default_value_t = 1)]
    workers: u32,

    /// Permits taken per request
    #[arg(short, long, default_value_t = 1)]
    permits: u32,

    /// Use a bounded try-acquire with this timeout instead of blocking
    #[arg(long)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Default)]
struct WorkerReport {
    granted: u32,
    denied: u32,
    waited: Duration,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = FleetrateConfig::load(args.config.as_deref())?;
    init_tracing(&config.logging)?;

    info!("Starting Fleetrate probe");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        backend = ?config.store.backend,
        url = %config.store.url,
        lease_ms = config.lock.lease_ms,
        "Configuration loaded"
    );

    let store = store::connect(&config.store).await?;
    let limiter = Arc::new(
        DistributedRateLimiter::create(
            store,
            args.key.clone(),
            args.rate,
            LimiterOptions::from(&config),
        )
        .await?,
    );
    info!(key = %args.key, rate = args.rate, "Rate limiter initialized");

    let started = Instant::now();
    let workers = (0..args.workers).map(|id| {
        let limiter = limiter.clone();
        let timeout = args.timeout_ms.map(Duration::from_millis);
        let (requests, permits) = (args.requests, args.permits);
        tokio::spawn(async move { run_worker(id, limiter, requests, permits, timeout).await })
    });

    let reports = tokio::select! {
        reports = join_all(workers) => reports,
        _ = shutdown_signal() => {
            warn!("Interrupted before all workers finished");
            return Ok(());
        }
    };

    let mut total = WorkerReport::default();
    for report in reports {
        let report = report??;
        total.granted += report.granted;
        total.denied += report.denied;
        total.waited += report.waited;
    }

    let elapsed = started.elapsed();
    let observed_rate =
        f64::from(total.granted * args.permits) / elapsed.as_secs_f64().max(f64::EPSILON);
    info!(
        granted = total.granted,
        denied = total.denied,
        waited = ?total.waited,
        elapsed = ?elapsed,
        observed_rate,
        "Probe finished"
    );
    Ok(())
}

async fn run_worker<S: StateStore + ?Sized>(
    id: u32,
    limiter: Arc<DistributedRateLimiter<S>>,
    requests: u32,
    permits: u32,
    timeout: Option<Duration>,
) -> fleetrate::Result<WorkerReport> {
    let mut report = WorkerReport::default();
    for request in 0..requests {
        match timeout {
            Some(timeout) => {
                if limiter.try_acquire(permits, timeout).await? {
                    report.granted += 1;
                    info!(worker = id, request, "Granted");
                } else {
                    report.denied += 1;
                    info!(worker = id, request, "Denied");
                }
            }
            None => {
                let waited = limiter.acquire(permits).await?;
                report.granted += 1;
                report.waited += Duration::from_secs_f64(waited);
                info!(worker = id, request, waited_secs = waited, "Granted");
            }
        }
    }
    Ok(report)
}

fn init_tracing(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
