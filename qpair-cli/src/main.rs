//! CLI for exercising qpair queue pairs and the reference peer.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod loopback;
mod peer;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use qpair::{INVALID_ID, TableConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "qpair", version, about = "Shared-memory queue pair diagnostics")]
struct Cli {
    /// Log at debug level (overridden by RUST_LOG).
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Table configuration file (JSON).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Measure throughput over a local queue pair.
    Loopback(loopback::LoopbackArgs),

    /// Run the reference negotiation peer on a Unix socket.
    Peer(peer::PeerArgs),

    /// Allocate a queue pair against a running peer, then detach it.
    Probe(peer::ProbeArgs),

    /// Show or create the table configuration.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

/// Subcommands for `qpair config`.
#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration.
    Show {
        /// Output format.
        #[arg(long, default_value = "json")]
        format: OutputFormat,
    },
    /// Write a default configuration file.
    Init {
        /// Destination (default: the per-user config path).
        path: Option<PathBuf>,
        /// Overwrite an existing file.
        #[arg(short = 'f', long)]
        force: bool,
    },
}

/// Output format for reporting commands.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub(crate) enum OutputFormat {
    /// Human-readable table.
    #[default]
    Table,
    /// Machine-readable JSON.
    Json,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    if let Err(e) = cli.dispatch() {
        eprintln!("qpair: {e:#}");
        std::process::exit(1);
    }
}

impl Cli {
    fn dispatch(self) -> Result<()> {
        let config_path = self.config;
        match self.command {
            Command::Loopback(args) => loopback::run(&args, load_config(config_path.as_deref())?),
            Command::Peer(args) => peer::serve(&args),
            Command::Probe(args) => peer::probe(&args, load_config(config_path.as_deref())?),
            Command::Config { action } => config_cmd(action, config_path.as_deref()),
            Command::Completion { shell } => {
                clap_complete::generate(
                    shell,
                    &mut Self::command(),
                    "qpair",
                    &mut std::io::stdout(),
                );
                Ok(())
            }
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Per-user configuration path, if the platform has one.
fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("qpair").join("config.json"))
}

/// Loads `--config`, else the per-user file when present, else defaults.
fn load_config(explicit: Option<&Path>) -> Result<TableConfig> {
    if let Some(path) = explicit {
        return TableConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()));
    }
    match default_config_path() {
        Some(path) if path.exists() => TableConfig::load(&path)
            .with_context(|| format!("failed to load config {}", path.display())),
        _ => Ok(TableConfig::default()),
    }
}

/// Applies a `--context` override, requiring a usable id from somewhere.
pub(crate) fn with_context_id(mut config: TableConfig, context: Option<u32>) -> Result<TableConfig> {
    if let Some(id) = context {
        config.context_id = id;
    }
    if config.context_id == INVALID_ID {
        anyhow::bail!("no context id: pass --context or set context_id in the config");
    }
    Ok(config)
}

fn config_cmd(action: ConfigAction, explicit: Option<&Path>) -> Result<()> {
    match action {
        ConfigAction::Show { format } => {
            let config = load_config(explicit)?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&config)?),
                OutputFormat::Table => {
                    let context = if config.context_id == INVALID_ID {
                        "unset".to_owned()
                    } else {
                        config.context_id.to_string()
                    };
                    println!("context_id:            {context}");
                    println!("page_size:             {}", config.page_size);
                    println!("reserved_resource_ids: {}", config.reserved_resource_ids);
                    println!(
                        "max_queue_memory:      {}",
                        human_size(config.max_queue_memory)
                    );
                    println!("failed_set_capacity:   {}", config.failed_set_capacity);
                }
            }
        }
        ConfigAction::Init { path, force } => {
            let path = path
                .or_else(|| explicit.map(Path::to_path_buf))
                .or_else(default_config_path)
                .context("no platform config directory; pass a path")?;
            if path.exists() && !force {
                anyhow::bail!("{} already exists (use --force)", path.display());
            }
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            TableConfig::default()
                .save(&path)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("{}", path.display());
        }
    }
    Ok(())
}

/// Formats bytes into a human-readable size string.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn human_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    for unit in UNITS {
        if size < 1024.0 {
            return format!("{size:.1} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.1} TB")
}
