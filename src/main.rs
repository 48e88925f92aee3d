//! flowprobe CLI entry point.

use std::io::{self, BufWriter};
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use flowprobe::capture::{replay, ReplayOptions, ReplayStats};
use flowprobe::cli::{consume, Args, EventFormatter};
use flowprobe_core::{Engine, EngineConfig, QueueSink};

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Set up logging
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| args.log_level().into()),
        )
        .init();

    if args.queue_capacity == 0 {
        bail!("--queue-capacity must be at least 1");
    }
    for file in &args.files {
        if !file.exists() {
            bail!("Capture file not found: {}", file.display());
        }
    }

    let config = EngineConfig::default()
        .with_default_ttl(args.ttl)
        .with_event_queue_capacity(args.queue_capacity);
    let (sink, events) = QueueSink::new(config.event_queue_capacity);
    let engine = Engine::new(config, Arc::new(sink));

    let reaper = if args.no_reaper {
        None
    } else {
        Some(engine.spawn_reaper().context("Failed to start reaper thread")?)
    };

    // Events are written on their own thread so a slow terminal applies
    // back-pressure through the queue instead of buffering without bound.
    let formatter = EventFormatter::new(args.format);
    let writer = thread::Builder::new()
        .name("flowprobe-output".to_string())
        .spawn(move || {
            let stdout = io::stdout();
            let mut out = BufWriter::new(stdout.lock());
            consume(events, &formatter, &mut out)
        })
        .context("Failed to start output thread")?;

    let options = ReplayOptions {
        device: args.device.clone(),
        network: args.network.clone(),
        target: args.target,
    };

    let mut total = ReplayStats::default();
    let mut failure = None;
    for file in &args.files {
        match replay(&engine, file, &options)
            .with_context(|| format!("Failed to replay capture file: {}", file.display()))
        {
            Ok(stats) => total.merge(stats),
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }

    drop(reaper);
    // Queued events still describe their ancestry, so the tree outlives the
    // engine until the output thread is done. Dropping the engine releases
    // the last sender, which ends that thread.
    let root = engine.get_root_context(&args.device, &args.network);
    engine.close_root_context(&args.device, &args.network);
    drop(engine);

    let written = match writer.join() {
        Ok(result) => result.context("Failed to write events")?,
        Err(_) => bail!("Output thread panicked"),
    };
    drop(root);

    info!(
        frames = total.frames,
        dispatched = total.dispatched,
        skipped = total.skipped,
        errors = total.errors,
        events = written,
        "replay finished"
    );
    if total.errors > 0 {
        warn!(errors = total.errors, "some packets could not be decoded");
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
