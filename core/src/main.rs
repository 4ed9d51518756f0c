use clap::Parser;
use fluxgate::{Gateway, GatewayConfig, Result};
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "fluxgate")]
#[command(about = "A Kafka protocol gateway speaking a flow-controlled stream protocol")]
struct Args {
    /// Configuration file (toml, yaml or json); FLUXGATE_* variables override it
    #[arg(short, long)]
    config: Option<String>,

    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    /// Bootstrap brokers as host:port, comma separated
    #[arg(short, long, value_delimiter = ',')]
    bootstrap: Vec<String>,

    #[arg(short, long)]
    workers: Option<usize>,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Seconds between metrics reports, 0 disables them
    #[arg(long, default_value = "60")]
    metrics_interval: u64,
}

impl Args {
    fn load_config(&self) -> Result<GatewayConfig> {
        let mut config = match &self.config {
            Some(path) => GatewayConfig::from_file(path)?,
            None => GatewayConfig::from_env()?,
        };
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if !self.bootstrap.is_empty() {
            config.bootstrap = self.bootstrap.clone();
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(parse_log_level(&args.log_level))
        .init();

    let config = args.load_config()?;
    info!("Starting FluxGate on {}:{}", config.host, config.port);
    info!("Bootstrap brokers: {}", config.bootstrap.join(","));
    info!("Workers: {}", config.workers);
    info!("Connection pool enabled: {}", config.client_connection_pool);
    if config.sasl.is_some() {
        info!("SASL authentication enabled");
    }

    let gateway = Gateway::new(config)?;

    if args.metrics_interval > 0 {
        let metrics = gateway.metrics();
        let period = Duration::from_secs(args.metrics_interval);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                metrics.report();
            }
        });
    }

    gateway
        .run_until(async {
            match signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
                Err(e) => warn!("Failed to listen for Ctrl+C: {}", e),
            }
        })
        .await?;

    info!("FluxGate shut down successfully");
    Ok(())
}

fn parse_log_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => {
            warn!("Invalid log level '{}', defaulting to 'info'", level);
            tracing::Level::INFO
        }
    }
}
