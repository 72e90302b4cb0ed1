use anyhow::Result;
use chrono::Local;
use clap::Parser;
use rolling_file::{RollingConditionBasic, RollingFileAppender};
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use zonedns::config::Config;

// Log timestamps in local time rather than UTC.
struct LocalTimer;
impl fmt::time::FormatTime for LocalTimer {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

#[derive(Parser, Debug)]
#[command(name = "zonedns")]
#[command(about = "An embeddable DNS server engine", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "Corefile")]
    config: String,

    /// UDP and TCP address used when the config has no `listen` block.
    #[arg(long, default_value = "0.0.0.0:53")]
    address: SocketAddr,

    #[arg(long, default_value = "logs")]
    log_dir: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cores)
        .thread_name("zonedns-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args, cores))
}

async fn async_main(args: Args, cores: usize) -> Result<()> {
    std::fs::create_dir_all(&args.log_dir)?;
    let file_appender = RollingFileAppender::new(
        format!("{}/zonedns.log", args.log_dir),
        RollingConditionBasic::new().daily(),
        30,
    )?;
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false).with_timer(LocalTimer))
        .with(fmt::layer().with_writer(std::io::stdout).with_timer(LocalTimer))
        .init();

    info!("Starting zonedns version {}", env!("CARGO_PKG_VERSION"));
    info!(">>> Running on {} worker threads", cores);

    let config = Config::load(&args.config)?;
    info!(">>> Loaded {} server block(s) from {}", config.blocks.len(), args.config);

    let server = config.build_server(args.address).await?;
    let bound = server.start().await?;
    info!("Server ready on {:?}", bound);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, closing transports");
    server.stop().await;
    Ok(())
}
