//! `butlers` — fleet CLI.
//!
//! Exit codes: 0 on success, non-zero with an actionable message on
//! stderr for config, credential, or migration failures.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

mod init;

/// Fleet CLI for the butlers agent daemons.
#[derive(Debug, Parser)]
#[command(name = "butlers", version, about)]
struct Cli {
    /// Root directory holding one config directory per butler.
    #[arg(long, env = "BUTLERS_CONFIG_ROOT", default_value = "./butlers")]
    config_root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start every butler under the config root (or a subset).
    Up {
        /// Only start the named butlers.
        #[arg(long = "only")]
        only: Vec<String>,
    },
    /// Run a single butler from an explicit config directory.
    Run {
        /// The butler's config directory.
        #[arg(long)]
        config: PathBuf,
    },
    /// List butlers found under the config root.
    List,
    /// Scaffold a new butler config directory.
    Init {
        /// Butler name.
        name: String,
        /// RPC port.
        #[arg(long)]
        port: u16,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    butlers_telemetry::setup_default_logging().context("failed to initialize logging")?;
    let cli = Cli::parse();

    match cli.command {
        Command::Up { only } => up(&cli.config_root, &only).await,
        Command::Run { config } => run_one(&config).await,
        Command::List => list(&cli.config_root),
        Command::Init { name, port } => init::scaffold(&cli.config_root, &name, port),
    }
}

async fn up(config_root: &std::path::Path, only: &[String]) -> anyhow::Result<()> {
    let database_url = butlers_daemon::database_url_from_env()
        .context("database configuration missing")?;

    let mut butlers = Vec::new();
    for dir in discover(config_root)? {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !only.is_empty() && !only.iter().any(|o| o == &name) {
            continue;
        }
        let butler = butlers_daemon::Butler::start(&dir, &database_url)
            .await
            .with_context(|| format!("failed to start butler '{name}'"))?;
        println!("started {} on {}", butler.name(), butler.addr());
        butlers.push(butler);
    }
    if butlers.is_empty() {
        anyhow::bail!(
            "no butler config directories under {}",
            config_root.display()
        );
    }

    tokio::signal::ctrl_c().await.context("signal handler")?;
    println!("shutting down {} butlers", butlers.len());
    for butler in butlers {
        butler.shutdown().await;
    }
    Ok(())
}

async fn run_one(config: &std::path::Path) -> anyhow::Result<()> {
    let database_url = butlers_daemon::database_url_from_env()
        .context("database configuration missing")?;
    let butler = butlers_daemon::Butler::start(config, &database_url)
        .await
        .with_context(|| format!("failed to start butler from {}", config.display()))?;
    println!("started {} on {}", butler.name(), butler.addr());
    tokio::signal::ctrl_c().await.context("signal handler")?;
    butler.shutdown().await;
    Ok(())
}

fn list(config_root: &std::path::Path) -> anyhow::Result<()> {
    for dir in discover(config_root)? {
        match butlers_config::load_dir(&dir) {
            Ok(manifest) => println!(
                "{:<16} port {:<6} schema {:<16} modules [{}]",
                manifest.butler.name,
                manifest.butler.port,
                manifest.butler.db.schema,
                manifest
                    .modules
                    .keys()
                    .map(String::as_str)
                    .collect::<Vec<_>>()
                    .join(", "),
            ),
            Err(e) => println!("{:<16} INVALID: {e}", dir.display()),
        }
    }
    Ok(())
}

/// Config directories are immediate children containing `butler.toml`.
fn discover(config_root: &std::path::Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    let entries = std::fs::read_dir(config_root)
        .with_context(|| format!("cannot read config root {}", config_root.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() && path.join(butlers_config::MANIFEST_FILE).is_file() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}
