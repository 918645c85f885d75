//! `qpair peer` and `qpair probe`: both ends of socket negotiation.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use qpair::{
    AllocParams, ChannelHandle, EndpointTable, INVALID_ID, QpFlags, StreamNegotiator, TableConfig,
};
use qpair_peer::PeerRegistry;
use tracing::info;

use crate::{OutputFormat, with_context_id};

/// Arguments for `qpair peer`.
#[derive(clap::Args)]
pub struct PeerArgs {
    /// Unix socket path to listen on.
    #[arg(short = 's', long)]
    pub socket: PathBuf,

    /// Remove a stale socket file before binding.
    #[arg(long)]
    pub replace: bool,
}

/// Arguments for `qpair probe`.
#[derive(clap::Args)]
pub struct ProbeArgs {
    /// Unix socket path of a running peer.
    #[arg(short = 's', long)]
    pub socket: PathBuf,

    /// Context id for the table (default: from the config).
    #[arg(long)]
    pub context: Option<u32>,

    /// Explicit handle (`context:resource`); minted when omitted.
    #[arg(long)]
    pub handle: Option<ChannelHandle>,

    /// Peer context id allowed to attach (default: any).
    #[arg(long)]
    pub peer: Option<u32>,

    /// Produce ring capacity in bytes.
    #[arg(long, default_value_t = 4096)]
    pub produce: u64,

    /// Consume ring capacity in bytes.
    #[arg(long, default_value_t = 4096)]
    pub consume: u64,

    /// Only attach to a queue pair the peer already knows.
    #[arg(long)]
    pub attach_only: bool,

    /// Run a hibernation conversion and wake before detaching.
    #[arg(long)]
    pub hibernate: bool,

    /// Output format.
    #[arg(long, default_value = "table")]
    pub format: OutputFormat,
}

/// Serves the reference peer until the process is killed.
#[cfg(unix)]
pub fn serve(args: &PeerArgs) -> Result<()> {
    use std::os::unix::net::UnixListener;

    if args.replace && args.socket.exists() {
        std::fs::remove_file(&args.socket)
            .with_context(|| format!("failed to remove {}", args.socket.display()))?;
    }
    let listener = UnixListener::bind(&args.socket)
        .with_context(|| format!("failed to bind {}", args.socket.display()))?;
    let registry = Arc::new(PeerRegistry::new());
    qpair_peer::serve(&listener, &registry).context("peer stopped")
}

#[cfg(not(unix))]
pub fn serve(_args: &PeerArgs) -> Result<()> {
    anyhow::bail!("the reference peer requires Unix sockets")
}

/// Allocates one queue pair through a running peer and tears it down.
#[cfg(unix)]
pub fn probe(args: &ProbeArgs, config: TableConfig) -> Result<()> {
    let config = with_context_id(config, args.context)?;
    let negotiator = StreamNegotiator::connect(&args.socket)
        .with_context(|| format!("failed to connect to {}", args.socket.display()))?;
    let table = EndpointTable::builder()
        .config(config)
        .negotiator(negotiator)
        .build()
        .context("failed to build endpoint table")?;

    let mut params = AllocParams::new(args.produce, args.consume)
        .peer(args.peer.unwrap_or(INVALID_ID));
    if let Some(handle) = args.handle {
        params = params.handle(handle);
    }
    if args.attach_only {
        params = params.flags(QpFlags::ATTACH_ONLY);
    }

    let qp = table.alloc(&params).context("queue pair allocation failed")?;
    let allocated = table
        .endpoint(qp.handle())
        .context("allocated queue pair missing from table")?;
    info!(handle = %qp.handle(), "queue pair allocated");

    let hibernation = if args.hibernate {
        let summary = table.convert_to_local();
        table.wake(false);
        Some(summary)
    } else {
        None
    };
    let after = table.endpoint(qp.handle());
    qp.detach().context("detach failed")?;

    if matches!(args.format, OutputFormat::Json) {
        let obj = serde_json::json!({
            "allocated": allocated,
            "hibernation": hibernation,
            "after_hibernation": hibernation.and(after),
        });
        println!("{}", serde_json::to_string_pretty(&obj)?);
        return Ok(());
    }

    println!("handle:   {}", allocated.handle);
    println!(
        "capacity: {} produce / {} consume",
        allocated.produce_size, allocated.consume_size
    );
    if let Some(summary) = hibernation {
        let local = after.is_some_and(|info| info.local);
        println!(
            "hibernate: {} converted, {} failed (queue pair {})",
            summary.converted,
            summary.failed,
            if local { "local" } else { "still shared" }
        );
    }
    println!("detached");
    Ok(())
}

#[cfg(not(unix))]
pub fn probe(_args: &ProbeArgs, _config: TableConfig) -> Result<()> {
    anyhow::bail!("probing a peer requires Unix sockets")
}
