//! Jambox Agent
//!
//! Command line entry point: loads the rule configuration, prepares the root
//! CA and runs the intercepting proxy with its admin surface.

use anyhow::{Context, Result};
use clap::Parser;
use jambox_core::{CertificateAuthority, JamboxConfig, ProxyServer, ProxyStartupConfig};
use std::future::Future;
use std::path::PathBuf;

pub mod logging;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Address to listen on for HTTP/HTTPS traffic
    #[arg(long, default_value = "127.0.0.1")]
    pub listen_addr: String,

    /// Port to listen on for HTTP/HTTPS traffic
    #[arg(long, default_value_t = 9000)]
    pub listen_port: u16,

    /// Port to expose the Admin API (health/metrics/event feed)
    #[arg(long, default_value_t = 9001)]
    pub admin_port: u16,

    /// Rule configuration file (JSON)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Directory holding (or receiving) the root CA
    #[arg(long, default_value = "./certs")]
    pub ca_dir: PathBuf,

    /// Neither replay nor record cache entries
    #[arg(long)]
    pub bypass_cache: bool,

    /// Log level or filter directive (RUST_LOG takes precedence)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,

    /// Also write logs to this file
    #[arg(long)]
    pub log_file: Option<String>,
}

impl Args {
    pub fn startup_config(&self) -> ProxyStartupConfig {
        ProxyStartupConfig {
            listen_address: self.listen_addr.clone(),
            listen_port: self.listen_port,
            admin_port: self.admin_port,
            ca_dir: self.ca_dir.clone(),
            ..Default::default()
        }
    }

    pub fn logging_config(&self) -> logging::LoggingConfig {
        logging::LoggingConfig {
            level: self.log_level.clone(),
            json_format: self.json_logs,
            log_file: self.log_file.clone(),
            ..Default::default()
        }
    }

    /// The rule configuration, or an empty one (plain passthrough) when none is given.
    pub fn load_config(&self) -> Result<JamboxConfig> {
        match &self.config {
            Some(path) => JamboxConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display())),
            None => Ok(JamboxConfig::default()),
        }
    }
}

pub async fn run_agent(args: Args) -> Result<()> {
    run_agent_until(args, std::future::pending::<()>()).await
}

pub async fn run_agent_until<F>(args: Args, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tracing::info!("Starting Jambox...");
    tracing::info!("  Listen: {}:{}", args.listen_addr, args.listen_port);
    tracing::info!("  Admin:  {}:{}", args.listen_addr, args.admin_port);

    let config = args.load_config()?;
    if config.paused {
        tracing::info!("  Paused: all traffic passes through");
    }
    if config.block_network_requests {
        tracing::info!("  Network requests are blocked");
    }

    let startup = args.startup_config();
    let ca = CertificateAuthority::new(&startup.ca_dir)
        .with_context(|| format!("Failed to prepare CA in {}", startup.ca_dir.display()))?;
    tracing::info!("  CA:     {}", startup.ca_dir.join("ca.pem").display());

    ProxyServer::new(startup, config, ca)
        .with_bypass(args.bypass_cache)
        .run_until(shutdown)
        .await?;

    Ok(())
}
