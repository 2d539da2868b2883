use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use crate::core::{
    backend::HttpBackend,
    config::ClientConfig,
    controller::CardReadController,
    health::HealthMonitor,
    reader::{CardSource, PcscCardSource},
    state::{ConnectionStatus, OperationState},
    utils::display_atr,
};
use crate::server::{self, ServerConfig};

#[derive(Parser)]
#[command(name = "icreader")]
#[command(about = "IC card reader client: backend health monitoring and card reads")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// JSON client config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Base URL of the reader API
    #[arg(long, global = true, env = "ICREADER_API_URL")]
    pub api_url: Option<String>,

    /// Seconds between health probes
    #[arg(long, global = true)]
    pub interval_secs: Option<u64>,

    /// Timeout of one health probe, in seconds
    #[arg(long, global = true)]
    pub probe_timeout_secs: Option<u64>,

    /// Timeout of one card read, in seconds
    #[arg(long, global = true)]
    pub read_timeout_secs: Option<u64>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Probe the reader backend once
    Health,

    /// Read the card currently in the reader
    Read,

    /// Monitor the reader backend and print status changes
    Watch {
        /// Stop after this many status changes
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },

    /// List PC/SC readers attached to this machine
    Readers,

    /// Run the HTTP reader service on this machine
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to listen on
        #[arg(short, long, default_value_t = 5000)]
        port: u16,

        /// Reader name (defaults to the first attached reader)
        #[arg(short, long)]
        reader: Option<String>,
    },

    /// Print the effective client configuration
    Config,
}

impl Cli {
    /// Config file (or defaults) with command-line overrides applied
    pub fn client_config(&self) -> Result<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::load(path)?,
            None => ClientConfig::default(),
        };

        if let Some(url) = &self.api_url {
            config.base_url = url.clone();
        }
        if let Some(secs) = self.interval_secs {
            config.probe_interval_secs = secs;
        }
        if let Some(secs) = self.probe_timeout_secs {
            config.probe_timeout_secs = secs;
        }
        if let Some(secs) = self.read_timeout_secs {
            config.read_timeout_secs = secs;
        }

        config.validate()?;
        Ok(config)
    }
}

pub fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.debug {
        log::LevelFilter::Debug
    } else if cli.verbose {
        log::LevelFilter::Info
    } else {
        log::LevelFilter::Warn
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    match &cli.command {
        Commands::Health => runtime.block_on(cmd_health(&cli.client_config()?)),
        Commands::Read => runtime.block_on(cmd_read(&cli.client_config()?)),
        Commands::Watch { count } => runtime.block_on(cmd_watch(&cli.client_config()?, *count)),
        Commands::Readers => cmd_readers(),
        Commands::Serve { host, port, reader } => {
            let config = ServerConfig {
                host: host.clone(),
                port: *port,
                reader: reader.clone(),
            };
            runtime.block_on(cmd_serve(&config))
        }
        Commands::Config => cmd_config(&cli.client_config()?),
    }
}

async fn cmd_health(config: &ClientConfig) -> Result<()> {
    let backend = Arc::new(HttpBackend::new(config)?);
    let url = backend.health_url().to_string();
    let monitor = HealthMonitor::new(backend, config);

    let status = monitor.probe().await.unwrap_or(ConnectionStatus::Offline);
    println!("{status}");

    if !status.is_online() {
        bail!("Reader backend is offline ({url})");
    }
    Ok(())
}

async fn cmd_read(config: &ClientConfig) -> Result<()> {
    let backend = Arc::new(HttpBackend::new(config)?);
    let monitor = HealthMonitor::new(backend.clone(), config);

    if monitor.probe().await != Some(ConnectionStatus::Online) {
        println!("Reader backend is offline.");
        bail!("Cannot read card: backend at {} is not reachable", config.base_url);
    }

    let mut controller = CardReadController::new(backend, monitor.subscribe(), config);
    match controller.read().await {
        OperationState::Success(card) => {
            println!("Card detected");
            println!("  ATR:    {}", display_atr(&card.atr));
            println!("  Reader: {}", card.reader);
            if let Ok(bytes) = card.atr_bytes() {
                println!("  Length: {} bytes", bytes.len());
            }
            Ok(())
        }
        OperationState::Error(error) => {
            println!("Error ({}): {}", error.kind, error.message);
            bail!("Card read failed");
        }
        other => bail!("Card read ended in unexpected state: {}", other.label()),
    }
}

async fn cmd_watch(config: &ClientConfig, count: Option<usize>) -> Result<()> {
    let backend = Arc::new(HttpBackend::new(config)?);
    let mut monitor = HealthMonitor::new(backend, config);
    let mut reports = monitor.subscribe();

    println!("Watching {} (every {}s)", config.base_url, config.probe_interval_secs);
    monitor.start();

    let mut printed = 0;
    let mut last: Option<ConnectionStatus> = None;
    while count.map_or(true, |limit| printed < limit) {
        tokio::select! {
            changed = reports.changed() => {
                if changed.is_err() {
                    break;
                }
                let report = *reports.borrow_and_update();
                if last != Some(report.status) {
                    let at = report
                        .checked_at
                        .map(|t| t.format("%H:%M:%S").to_string())
                        .unwrap_or_default();
                    println!("[{at}] {}", report.status);
                    last = Some(report.status);
                    printed += 1;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    monitor.stop().await;
    Ok(())
}

fn cmd_readers() -> Result<()> {
    let readers = PcscCardSource::new()
        .list_readers()
        .context("Failed to list readers")?;

    if readers.is_empty() {
        println!("No PCSC readers found.");
        return Ok(());
    }

    println!("Available PCSC readers:");
    for (i, name) in readers.iter().enumerate() {
        println!("  [{i}] {name}");
    }
    Ok(())
}

async fn cmd_serve(config: &ServerConfig) -> Result<()> {
    println!("IC card reader service on {}", config.url());
    server::serve(config, Arc::new(PcscCardSource::new())).await
}

fn cmd_config(config: &ClientConfig) -> Result<()> {
    let json = serde_json::to_string_pretty(config).context("Failed to encode config")?;
    println!("{json}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("icreader").chain(args.iter().copied())).unwrap()
    }

    #[test]
    #[serial]
    fn test_overrides_apply_on_top_of_defaults() {
        std::env::remove_var("ICREADER_API_URL");
        let cli = parse(&["--api-url", "http://10.0.0.2:5000/api", "--interval-secs", "2", "health"]);
        let config = cli.client_config().unwrap();
        assert_eq!(config.base_url, "http://10.0.0.2:5000/api");
        assert_eq!(config.probe_interval_secs, 2);
        assert_eq!(config.read_timeout_secs, 10);
    }

    #[test]
    #[serial]
    fn test_api_url_from_environment() {
        std::env::set_var("ICREADER_API_URL", "http://192.168.1.20:5000/api");
        let cli = parse(&["config"]);
        std::env::remove_var("ICREADER_API_URL");

        assert_eq!(
            cli.client_config().unwrap().base_url,
            "http://192.168.1.20:5000/api"
        );
    }

    #[test]
    #[serial]
    fn test_invalid_override_rejected() {
        std::env::remove_var("ICREADER_API_URL");
        let cli = parse(&["--interval-secs", "0", "watch"]);
        assert!(cli.client_config().is_err());
    }

    #[test]
    fn test_serve_defaults() {
        let cli = parse(&["serve"]);
        match cli.command {
            Commands::Serve { host, port, reader } => {
                assert_eq!(host, "127.0.0.1");
                assert_eq!(port, 5000);
                assert!(reader.is_none());
            }
            _ => panic!("Expected serve command"),
        }
    }
}
