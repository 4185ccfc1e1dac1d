//! otpd - the distributed-object cluster daemon.
//!
//! One process can host any subset of the four services: the message
//! director (routing fabric), client agent (public gateway), state server
//! (live object registry), and database server (persistent store).

mod allocator;
mod clientagent;
mod config;
mod database;
mod dclass;
mod error;
mod messagedirector;
mod network;
mod stateserver;
mod zones;

use std::sync::Arc;

use tracing::{error, info};

use crate::config::Config;

/// Parsed command line: an optional config path plus component switches.
struct Cli {
    config_path: Option<String>,
    messagedirector: bool,
    clientagent: bool,
    stateserver: bool,
    database: bool,
}

/// Supports `-c <path>`, `--config <path>`, or a bare path, plus
/// `--no-<component>` switches. Anything else is a usage error.
fn parse_cli() -> Result<Cli, String> {
    let mut cli = Cli {
        config_path: None,
        messagedirector: true,
        clientagent: true,
        stateserver: true,
        database: true,
    };

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                let path = args.next().ok_or_else(|| format!("Missing path after {arg}"))?;
                cli.config_path = Some(path);
            }
            "-nmd" | "--no-messagedirector" => cli.messagedirector = false,
            "-nca" | "--no-clientagent" => cli.clientagent = false,
            "-nss" | "--no-stateserver" => cli.stateserver = false,
            "-ndb" | "--no-database" => cli.database = false,
            path if !path.starts_with('-') && cli.config_path.is_none() => {
                cli.config_path = Some(path.to_string());
            }
            other => return Err(format!("Unknown argument: {other}")),
        }
    }
    Ok(cli)
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    match &cli.config_path {
        Some(path) => Config::load(path),
        None => {
            // The default path is optional; a bare install runs on
            // defaults alone.
            if std::path::Path::new("config.toml").exists() {
                Config::load("config.toml")
            } else {
                Ok(Config::default())
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = parse_cli().map_err(|e| {
        eprintln!("ERROR: {e}");
        anyhow::anyhow!("invalid command line")
    })?;

    let config = load_config(&cli).map_err(|e| {
        eprintln!("ERROR: Failed to load config: {e}");
        e
    })?;

    // Initialize tracing based on config.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match config.server.log_format {
        config::LogFormat::Json => {
            tracing_subscriber::fmt().with_env_filter(env_filter).with_target(true).json().init();
        }
        config::LogFormat::Pretty => {
            tracing_subscriber::fmt().with_env_filter(env_filter).with_target(true).init();
        }
    }

    if let Err(errors) = config::validate(&config) {
        for err in &errors {
            error!(error = %err, "Configuration validation failed");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // The type catalog every service consults.
    let catalog = match &config.schema.file {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            Arc::new(dclass::Catalog::from_toml(&raw)?)
        }
        None => Arc::new(dclass::game_schema()),
    };
    info!(hash = catalog.hash(), "Type catalog loaded");

    // The director goes first so the other components can reach it.
    if cli.messagedirector {
        let director = messagedirector::MessageDirector::bind(&config.messagedirector).await?;
        director.start();
        info!("Starting component: MessageDirector");
    }

    if cli.stateserver {
        info!("Starting component: StateServer");
        stateserver::start(&config.stateserver, Arc::clone(&catalog)).await?;
    }

    if cli.database {
        info!("Starting component: DatabaseServer");
        database::start(&config.database, Arc::clone(&catalog)).await?;
    }

    if cli.clientagent {
        info!("Starting component: ClientAgent");
        let vis = zones::provider_from_config(config.clientagent.dna_directory.as_deref());
        clientagent::start(config.clientagent.clone(), Arc::clone(&catalog), vis).await?;
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    Ok(())
}
