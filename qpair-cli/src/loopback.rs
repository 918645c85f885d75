//! `qpair loopback`: push bytes through a local queue pair between threads.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use qpair::{AllocParams, EndpointTable, QPair, QpFlags, TableConfig};
use tracing::debug;

use crate::{OutputFormat, human_size, with_context_id};

/// Arguments for `qpair loopback`.
#[derive(clap::Args)]
pub struct LoopbackArgs {
    /// Context id for the table (default: from the config).
    #[arg(long)]
    pub context: Option<u32>,

    /// Capacity of each ring in bytes.
    #[arg(long, default_value_t = 64 * 1024)]
    pub size: u64,

    /// Total bytes to transfer.
    #[arg(long, default_value_t = 64 * 1024 * 1024)]
    pub total: u64,

    /// Bytes per enqueue/dequeue call.
    #[arg(long, default_value_t = 4096)]
    pub chunk: usize,

    /// Output format.
    #[arg(long, default_value = "table")]
    pub format: OutputFormat,
}

pub fn run(args: &LoopbackArgs, config: TableConfig) -> Result<()> {
    anyhow::ensure!(args.chunk > 0, "--chunk must be positive");
    let config = with_context_id(config, args.context)?;
    let table = EndpointTable::builder()
        .config(config)
        .build()
        .context("failed to build endpoint table")?;

    let writer = table
        .alloc(&AllocParams::new(args.size, args.size).flags(QpFlags::LOCAL))
        .context("failed to create local queue pair")?;
    let reader = table
        .alloc(
            &AllocParams::new(args.size, args.size)
                .flags(QpFlags::LOCAL)
                .handle(writer.handle()),
        )
        .context("failed to attach to local queue pair")?;
    debug!(handle = %writer.handle(), "loopback pair ready");

    let start = Instant::now();
    let received = std::thread::scope(|s| -> Result<u64> {
        let producer = s.spawn(|| pump_out(&writer, args.total, args.chunk));
        let consumer = s.spawn(|| pump_in(&reader, args.total, args.chunk));
        producer
            .join()
            .map_err(|_| anyhow::anyhow!("producer thread panicked"))??;
        consumer
            .join()
            .map_err(|_| anyhow::anyhow!("consumer thread panicked"))?
    })?;
    let elapsed = start.elapsed();

    let handle = writer.handle();
    reader.detach().context("failed to detach reader")?;
    writer.detach().context("failed to detach writer")?;

    report(args.format, handle.to_string(), received, elapsed)
}

fn pump_out(qp: &QPair, total: u64, chunk: usize) -> Result<()> {
    let buf: Vec<u8> = (0..chunk).map(|i| (i % 251) as u8).collect();
    let mut sent = 0u64;
    while sent < total {
        let want = usize::try_from(total - sent).map_or(chunk, |left| left.min(chunk));
        match qp.enqueue(&buf[..want]) {
            Ok(n) => sent += n as u64,
            Err(e) if e.is_transient() => std::thread::yield_now(),
            Err(e) => return Err(e).context("enqueue failed"),
        }
    }
    Ok(())
}

fn pump_in(qp: &QPair, total: u64, chunk: usize) -> Result<u64> {
    let mut buf = vec![0u8; chunk];
    let mut received = 0u64;
    while received < total {
        match qp.dequeue(&mut buf) {
            Ok(n) => received += n as u64,
            Err(e) if e.is_transient() => std::thread::yield_now(),
            Err(e) => return Err(e).context("dequeue failed"),
        }
    }
    Ok(received)
}

#[allow(clippy::cast_precision_loss)]
fn report(format: OutputFormat, handle: String, bytes: u64, elapsed: Duration) -> Result<()> {
    let secs = elapsed.as_secs_f64();
    let rate = if secs > 0.0 { bytes as f64 / secs } else { 0.0 };

    if matches!(format, OutputFormat::Json) {
        let obj = serde_json::json!({
            "handle": handle,
            "bytes": bytes,
            "seconds": secs,
            "bytes_per_second": rate,
        });
        println!("{}", serde_json::to_string_pretty(&obj)?);
        return Ok(());
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let per_sec = human_size(rate as u64);
    println!("handle:     {handle}");
    println!("transfer:   {}", human_size(bytes));
    println!("elapsed:    {secs:.3} s");
    println!("throughput: {per_sec}/s");
    Ok(())
}
