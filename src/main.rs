use anyhow::Context;
use clap::Parser;
use connpool::config::Config;
use connpool::transport::{TcpConnector, TcpEndpoint};
use connpool::{CloseMethod, ConnPoolError, ConnectionPool};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const PROBE: &[u8] = b"ping";

#[derive(Parser, Debug)]
#[command(name = "connpool")]
#[command(about = "Drive request cycles through a bounded per-endpoint connection pool", long_about = None)]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Echo endpoint to probe (HOST:PORT)
    #[arg(short, long, value_name = "HOST:PORT")]
    target: Option<String>,

    /// Total number of acquire/probe/release cycles
    #[arg(short = 'n', long, default_value_t = 100)]
    requests: usize,

    /// Number of concurrent workers
    #[arg(long, default_value_t = 8)]
    concurrency: usize,

    /// Connection limit for the target (overrides config)
    #[arg(long)]
    max_connections: Option<usize>,

    /// Generate example configuration file
    #[arg(long, value_name = "FILE")]
    generate_config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error), overrides config
    #[arg(long)]
    log_level: Option<String>,

    /// Print pool statistics as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Handle config generation
    if let Some(config_path) = args.generate_config {
        println!("Generating example configuration file: {:?}", config_path);
        Config::create_example(&config_path)?;
        println!("Example configuration file created successfully!");
        println!(
            "Edit the file and run: connpool --config {:?} --target HOST:PORT",
            config_path
        );
        return Ok(());
    }

    let mut config = match &args.config {
        Some(config_path) => Config::from_file(config_path)
            .with_context(|| format!("loading configuration from {:?}", config_path))?,
        None => Config::default(),
    };

    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if let Some(max_connections) = args.max_connections {
        config.pool.default_max_connections = max_connections;
    }
    config.validate()?;

    init_logging(&config.logging.level, &config.logging.format)?;

    info!("connpool v{} starting", env!("CARGO_PKG_VERSION"));
    match &args.config {
        Some(path) => info!("Loaded configuration from: {:?}", path),
        None => info!("No configuration file specified, using defaults"),
    }

    let target: TcpEndpoint = args
        .target
        .as_deref()
        .context("--target HOST:PORT is required")?
        .parse()?;

    let pool = Arc::new(ConnectionPool::new(
        TcpConnector::from_config(&config.connector),
        config.pool.clone(),
    ));
    let cancel = CancellationToken::new();

    info!(
        "Running {} request(s) against {} with concurrency {} (max connections: {})",
        args.requests,
        target,
        args.concurrency,
        config.pool.default_max_connections
    );

    // Handle Ctrl+C for graceful shutdown
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, stopping...");
                cancel.cancel();
            }
        })
    };

    let started = Instant::now();
    let outcome = run_workload(
        Arc::clone(&pool),
        target,
        args.requests,
        args.concurrency.max(1),
        cancel.clone(),
    )
    .await;
    ctrl_c.abort();

    info!(
        "Completed {} request(s), {} failed, in {:?}",
        outcome.completed,
        outcome.failed,
        started.elapsed()
    );

    let stats = pool.stats();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!(
            "Pool: {} live, {} idle, {} waiting",
            stats.total_live, stats.total_idle, stats.total_waiters
        );
        for endpoint in &stats.endpoints {
            println!(
                "  {}: max={} live={} idle={} checked_out={} created={} reused={} handoffs={}",
                endpoint.endpoint,
                endpoint.max_connections,
                endpoint.live,
                endpoint.idle,
                endpoint.checked_out,
                endpoint.created_total,
                endpoint.reused_total,
                endpoint.handoffs_total
            );
        }
    }

    if let Err(e) = pool.dispose_all().await {
        error!("Pool dispose error: {}", e);
        return Err(e.into());
    }
    info!("Pool disposed");

    Ok(())
}

#[derive(Debug, Default)]
struct Outcome {
    completed: usize,
    failed: usize,
}

async fn run_workload(
    pool: Arc<ConnectionPool<TcpConnector>>,
    target: TcpEndpoint,
    requests: usize,
    concurrency: usize,
    cancel: CancellationToken,
) -> Outcome {
    let remaining = Arc::new(AtomicUsize::new(requests));
    let completed = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));

    let workers = (0..concurrency).map(|worker| {
        let pool = Arc::clone(&pool);
        let target = target.clone();
        let remaining = Arc::clone(&remaining);
        let completed = Arc::clone(&completed);
        let failed = Arc::clone(&failed);
        let cancel = cancel.clone();

        tokio::spawn(async move {
            while remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                match probe(&pool, &target, &cancel).await {
                    Ok(()) => {
                        completed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(ConnPoolError::Cancelled) => break,
                    Err(e) => {
                        warn!("Worker {}: request failed: {}", worker, e);
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            debug!("Worker {} finished", worker);
        })
    });

    for result in futures::future::join_all(workers).await {
        if let Err(e) = result {
            error!("Worker task failed: {}", e);
        }
    }

    Outcome {
        completed: completed.load(Ordering::Relaxed),
        failed: failed.load(Ordering::Relaxed),
    }
}

/// One request cycle: acquire, echo a probe, release.
async fn probe(
    pool: &ConnectionPool<TcpConnector>,
    target: &TcpEndpoint,
    cancel: &CancellationToken,
) -> connpool::Result<()> {
    let mut conn = pool.acquire(target, cancel).await?;

    match echo(&mut conn).await {
        Ok(()) => conn.close(CloseMethod::Graceful).await,
        Err(e) => {
            // The stream state is unknown, so it must not be reused.
            conn.close(CloseMethod::Abort).await?;
            Err(e.into())
        }
    }
}

async fn echo<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) -> std::io::Result<()> {
    stream.write_all(PROBE).await?;
    let mut reply = [0u8; PROBE.len()];
    stream.read_exact(&mut reply).await?;

    if reply != PROBE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "unexpected probe reply",
        ));
    }
    Ok(())
}

fn init_logging(level: &str, format: &str) -> connpool::Result<()> {
    let env_filter = EnvFilter::try_new(level)
        .map_err(|e| ConnPoolError::Config(format!("Invalid log level: {}", e)))?;

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    Ok(())
}
