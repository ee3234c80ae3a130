//! `vestibule` binary: serve the gateway, hash a password, check a config.

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vestibule_gateway::{GatewayConfig, GatewayServer, GatewayState, ReverseProxy};
use vestibule_security::password::validate_password_policy;
use vestibule_security::PasswordHashing;

const SECRET_ENV: &str = "VESTIBULE_INTERNAL_SECRET";

#[derive(Parser)]
#[command(name = "vestibule", about = "Vestibule: authenticating gateway for a local runtime")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "vestibule.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Print the Argon2id hash of a password read from stdin
    HashPassword,
    /// Validate the config and probe the upstream runtime
    CheckConfig,
}

#[derive(Deserialize)]
struct VestibuleConfig {
    #[serde(default = "default_data_dir")]
    data_dir: PathBuf,
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    gateway: GatewayConfig,
}

impl Default for VestibuleConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            server: ServerConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

#[derive(Deserialize)]
struct ServerConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    3000
}

/// Read and parse `path`. A missing file means all defaults.
async fn load_config(path: &Path) -> anyhow::Result<VestibuleConfig> {
    let mut config = match tokio::fs::read_to_string(path).await {
        Ok(raw) => toml::from_str::<VestibuleConfig>(&raw)
            .with_context(|| format!("Failed to parse config file '{}'", path.display()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "Config file not found, using defaults");
            VestibuleConfig::default()
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read config file '{}'", path.display()))
        }
    };

    if let Ok(secret) = std::env::var(SECRET_ENV) {
        config.gateway.upstream.internal_secret = secret;
    }
    config.gateway.validate()?;
    Ok(config)
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

async fn serve(config: VestibuleConfig, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let host = host.unwrap_or(config.server.host);
    let port = port.unwrap_or(config.server.port);

    if config.gateway.upstream.internal_secret.is_empty() {
        warn!("No internal secret configured; the runtime cannot tell proxied requests apart");
    }

    let state = GatewayState::new(config.gateway, &config.data_dir).await?;
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!(addr = %addr, "Starting Vestibule gateway");
    GatewayServer::serve(state, listener, shutdown_signal()).await?;
    Ok(())
}

fn hash_password(config: &VestibuleConfig) -> anyhow::Result<()> {
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read password from stdin")?;
    let password = line.trim_end_matches(['\r', '\n']);

    validate_password_policy(password)?;
    let hashing = PasswordHashing::new(&config.gateway.hashing)?;
    println!("{}", hashing.hash(password)?);
    Ok(())
}

async fn check_config(path: &Path, config: &VestibuleConfig) -> anyhow::Result<()> {
    println!("Config: {}", path.display());
    println!("  listen:      {}:{}", config.server.host, config.server.port);
    println!("  data_dir:    {}", config.data_dir.display());
    println!("  upstream:    {}", config.gateway.upstream.base_url);
    println!(
        "  secret:      {}",
        if config.gateway.upstream.internal_secret.is_empty() {
            "not set"
        } else {
            "set"
        }
    );
    println!(
        "  tunnels:     max {}, ping every {}ms",
        config.gateway.tunnel.max_connections, config.gateway.tunnel.ping_interval_ms
    );

    let proxy = ReverseProxy::new(&config.gateway.upstream)?;
    match proxy.probe().await {
        Ok(()) => {
            println!("Upstream status: ok");
            Ok(())
        }
        Err(e) => {
            println!("Upstream status: unreachable ({e})");
            Err(e.into())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Ignoring unreadable .env file: {e}");
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config).await?;

    match cli.command {
        Commands::Serve { host, port } => serve(config, host, port).await,
        Commands::HashPassword => hash_password(&config),
        Commands::CheckConfig => check_config(&cli.config, &config).await,
    }
}
