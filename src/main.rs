use anyhow::Context;
use clap::Parser;
use futures::stream::{self, StreamExt};
use rpcpool::config::Config;
use rpcpool::RpcClient;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "rpcpool")]
#[command(about = "Exercise a pooled RPC endpoint and report pool statistics", long_about = None)]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Endpoint host:port (overrides config)
    #[arg(long)]
    endpoint: Option<String>,

    /// Generate example configuration file
    #[arg(long, value_name = "FILE")]
    generate_config: Option<PathBuf>,

    /// Log level (overrides config)
    #[arg(long)]
    log_level: Option<String>,

    /// Number of request cycles to run
    #[arg(long, default_value_t = 100)]
    requests: u64,

    /// Concurrent callers
    #[arg(long, default_value_t = 8)]
    concurrency: usize,

    /// Send this payload and expect it echoed back. Without it each cycle is
    /// a bare checkout and return.
    #[arg(long)]
    payload: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(config_path) = args.generate_config {
        println!("Generating example configuration file: {:?}", config_path);
        Config::create_example(&config_path)?;
        println!("Example configuration file created successfully!");
        println!("Edit the file and run: rpcpool --config {:?}", config_path);
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::default(),
    };

    if let Some(endpoint) = args.endpoint {
        config.pool.endpoint = endpoint;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.validate()?;

    init_logging(&config.logging.level, &config.logging.format)?;

    info!("rpcpool v{} starting", env!("CARGO_PKG_VERSION"));
    match &args.config {
        Some(path) => info!("Loaded configuration from: {:?}", path),
        None => info!("No configuration file specified, using defaults"),
    }

    let options = config.pool.resolve();
    info!(
        endpoint = %options.endpoint,
        capacity = options.capacity,
        requests = args.requests,
        concurrency = args.concurrency,
        "Running request cycles"
    );

    let client = RpcClient::from_options(options);
    let payload = args.payload.map(String::into_bytes);
    let failed = AtomicU64::new(0);

    let run = stream::iter(0..args.requests).for_each_concurrent(args.concurrency.max(1), |i| {
        let client = &client;
        let payload = payload.as_deref();
        let failed = &failed;
        async move {
            let result = match payload {
                Some(payload) => client.echo(payload).await.and_then(|reply| {
                    if reply == payload {
                        Ok(())
                    } else {
                        Err(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            "echo reply does not match payload",
                        )
                        .into())
                    }
                }),
                None => match client.pool().get().await {
                    Ok(conn) => client.pool().put(conn),
                    Err(e) => Err(e),
                },
            };

            if let Err(e) = result {
                failed.fetch_add(1, Ordering::Relaxed);
                warn!("Request {} failed: {}", i, e);
            }
        }
    });

    tokio::select! {
        _ = run => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, stopping early");
        }
    }

    if let Err(e) = client.close().await {
        warn!("Error while closing pool: {}", e);
    }

    let failed = failed.load(Ordering::Relaxed);
    info!("Finished with {} failed request(s)", failed);
    println!("{}", serde_json::to_string_pretty(&client.stats())?);

    Ok(())
}

fn init_logging(level: &str, format: &str) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_new(level).context("invalid log level")?;

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }

    Ok(())
}
