//! offgrid - command-line host for the offline cache.
//!
//! Starts the caching runtime for the configured build and exposes a few
//! maintenance commands for inspecting and exercising it.

use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use offgrid_core::runtime::{self, Core};
use offgrid_core::{Config, FetchError, NamespaceStatus, Request, SessionKey};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const ENV_HELP: &str = "\
Environment:
  RUST_LOG                  Log filter (default: warn)
  OFFGRID_LOG_DIR           Also write logs to a daily file in this directory
  OFFGRID_BUILD_VERSION     Override the configured build version
  OFFGRID_BASE_URL          Override the configured backend URL
  OFFGRID_CACHE_DIR         Override the cache directory";

#[derive(Parser, Debug)]
#[command(
    name = "offgrid",
    about = "Offline-first cache for a build-versioned web backend",
    version,
    after_help = ENV_HELP
)]
struct Cli {
    /// Configuration file path (default: <config dir>/offgrid/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write the effective configuration to the config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Precache the current build and activate it
    Start,

    /// List cache namespaces
    Status,

    /// Fetch a URL through the cache
    Get {
        /// Absolute URL, or a path resolved against the backend URL
        url: String,
    },

    /// Look up a backend sheet
    Sheet {
        name: String,

        /// Query parameters as key=value
        #[arg(value_parser = parse_param)]
        params: Vec<(String, String)>,
    },

    /// Delete every cache namespace of this app
    Purge,
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got {:?}", s))
}

/// Initialize the tracing subscriber for logging.
/// The returned guard must be held until exit so file logs are flushed.
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=offgrid_core=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var("OFFGRID_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "offgrid.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        Err(_) => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    config.apply_env_overrides();
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let _guard = init_tracing();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    info!(build = %config.build_version, namespace = %config.namespace(), "offgrid starting");

    let core = runtime::init(Core::new(config).context("Failed to set up offline cache")?)?;
    let result = run(&core, cli.command, cli.config.as_deref()).await;
    runtime::shutdown();
    result
}

async fn run(core: &Core, command: Command, config_path: Option<&Path>) -> Result<()> {
    match command {
        Command::Init { force } => init_config(core.config(), config_path, force)?,
        Command::Start => {
            let report = core.start().await?;
            match report.install {
                Some(install) => println!(
                    "Installed {} ({} entries)",
                    install.namespace, install.entries
                ),
                None => println!("Reused {}", report.activation.namespace),
            }
            for name in &report.activation.deleted {
                println!("Deleted {}", name);
            }
            println!("Active: {}", report.activation.namespace);
        }
        Command::Status => {
            let namespaces = core.lifecycle().namespaces().await?;
            if namespaces.is_empty() {
                println!("No cache namespaces (current build: {})", core.config().build_version);
            }
            for ns in namespaces {
                let status = match ns.status {
                    NamespaceStatus::Active => "active",
                    NamespaceStatus::Installed => "installed",
                    NamespaceStatus::Superseded => "superseded",
                };
                println!("{:<40} {:<11} {} entries", ns.name, status, ns.entries);
            }
        }
        Command::Get { url } => {
            start_quietly(core).await;
            let url = core
                .config()
                .resolve(&url)
                .with_context(|| format!("Invalid URL: {}", url))?;
            let response = core.interceptor().handle(Request::get(url)).await;
            let age = response
                .age_display()
                .unwrap_or_else(|| "live".to_string());
            eprintln!("{} {:?} ({})", response.status, response.source, age);
            println!("{}", response.text());
        }
        Command::Sheet { name, params } => {
            start_quietly(core).await;
            let key = SessionKey::with_params(name, params);
            let data = core.api().sheet(key).await.map_err(explain_fetch_error)?;
            println!("{}", serde_json::to_string_pretty(&data)?);
        }
        Command::Purge => {
            let deleted = core.lifecycle().purge().await?;
            println!("Deleted {} namespace(s)", deleted.len());
        }
    }
    Ok(())
}

/// If the current build cannot be installed, lookups run against the
/// previous build's namespace.
async fn start_quietly(core: &Core) {
    if let Err(e) = core.start().await {
        warn!(error = %e, "Could not activate current build, continuing");
    }
}

fn init_config(config: &Config, path: Option<&Path>, force: bool) -> Result<()> {
    let target = match path {
        Some(path) => path.to_path_buf(),
        None => Config::config_path()?,
    };
    if target.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", target.display());
    }
    match path {
        Some(path) => config.save_to(path)?,
        None => config.save()?,
    }
    println!("Wrote {}", target.display());
    Ok(())
}

fn explain_fetch_error(e: FetchError) -> anyhow::Error {
    if e.is_connectivity() {
        anyhow::Error::new(e).context("Backend unreachable and nothing cached for this sheet")
    } else {
        e.into()
    }
}
