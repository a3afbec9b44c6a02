//! Replay a share log through the vardiff controller.
//!
//! Reads accepted shares from stdin, one per line:
//!
//! ```text
//! <unix timestamp> <worker> [job id]
//! ```
//!
//! Blank lines and lines starting with `#` are skipped. Every
//! `mining.set_difficulty` the controller issues is printed to stdout as
//! `<worker> <json>`. Useful for tuning the target interval and variance
//! against recorded traffic before changing a live pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tokio::signal::unix::{self, SignalKind};
use tokio::sync::mpsc;
use tokio_stream::{wrappers::LinesStream, StreamExt};
use tokio_util::task::TaskTracker;

use stratum_vardiff::config::Config;
use stratum_vardiff::network::{BitcoinRpc, NetworkDifficultyCache};
use stratum_vardiff::persistence::{spawn_recorder, DifficultyStore, MemoryStore};
use stratum_vardiff::session::{OutboundMessage, Session};
use stratum_vardiff::tracing::{self, prelude::*};
use stratum_vardiff::types::Timestamp;
use stratum_vardiff::vardiff::{SubmitOutcome, VardiffController};

const OUTBOUND_QUEUE: usize = 256;

/// One parsed line of the share log.
#[derive(Debug, PartialEq)]
struct ShareRecord<'a> {
    timestamp: Timestamp,
    worker: &'a str,
    job_id: &'a str,
}

fn parse_line(line: &str) -> Option<Result<ShareRecord<'_>>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    Some(parse_fields(line))
}

fn parse_fields(line: &str) -> Result<ShareRecord<'_>> {
    let mut fields = line.split_whitespace();
    let timestamp = fields
        .next()
        .context("missing timestamp")?
        .parse::<Timestamp>()
        .context("invalid timestamp")?;
    let worker = fields.next().context("missing worker")?;
    let job_id = fields.next().unwrap_or("");
    Ok(ShareRecord {
        timestamp,
        worker,
        job_id,
    })
}

async fn print_notifications(mut rx: mpsc::Receiver<OutboundMessage>) {
    while let Some(message) = rx.recv().await {
        println!("{} {}", message.session, message.notification.to_json());
    }
}

#[derive(Debug, Default)]
struct ReplayStats {
    shares: u64,
    skipped: u64,
    retargets: u64,
    evicted: usize,
}

async fn replay(
    vardiff: &VardiffController,
    outbound_tx: mpsc::Sender<OutboundMessage>,
) -> Result<ReplayStats> {
    let pool_target = vardiff.config().pool_target;
    let sweep_every = vardiff.config().sweep_interval as Timestamp;
    let mut next_sweep: Option<Timestamp> = None;
    let mut sessions: HashMap<String, Session> = HashMap::new();
    let mut stats = ReplayStats::default();
    let mut lines = LinesStream::new(BufReader::new(io::stdin()).lines());

    while let Some(line) = lines.next().await {
        let line = line.context("reading share log")?;
        let record = match parse_line(&line) {
            None => continue,
            Some(Ok(record)) => record,
            Some(Err(e)) => {
                warn!(line = %line, error = %e, "Skipping malformed share");
                stats.skipped += 1;
                continue;
            }
        };

        // Idle eviction follows log time, not the wall clock.
        match next_sweep {
            Some(at) if record.timestamp < at => {}
            Some(_) => {
                stats.evicted += vardiff.evict_idle(record.timestamp);
                next_sweep = Some(record.timestamp + sweep_every);
            }
            None => next_sweep = Some(record.timestamp + sweep_every),
        }

        let session = &*sessions
            .entry(record.worker.to_string())
            .or_insert_with(|| Session::new(record.worker, pool_target, outbound_tx.clone()));

        let outcome = vardiff.submit(
            session,
            record.job_id,
            session.difficulty(),
            record.timestamp,
            record.worker,
        );
        stats.shares += 1;
        if let SubmitOutcome::Retargeted { .. } = outcome {
            stats.retargets += 1;
        }
    }

    Ok(stats)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing::init_journald_or_stdout();

    let config = Config::load().context("loading configuration")?;

    let store = Arc::new(MemoryStore::new());
    store.clear_all_worker_difficulties().await?;
    let (recorder, recorder_handle) = spawn_recorder(store.clone());

    let network = if config.vardiff.use_network_cap {
        let rpc = BitcoinRpc::new(&config.rpc).context("creating RPC client")?;
        Some(NetworkDifficultyCache::new(
            Arc::new(rpc),
            Duration::from_secs(config.vardiff.difficulty_refresh_interval),
        ))
    } else {
        None
    };

    let vardiff = VardiffController::new(config.vardiff.clone(), recorder.clone(), network)?;

    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let tracker = TaskTracker::new();
    tracker.spawn(print_notifications(outbound_rx));
    tracker.close();
    info!("Started.");

    let mut sigint = unix::signal(SignalKind::interrupt())?;
    let mut sigterm = unix::signal(SignalKind::terminate())?;
    let stats = tokio::select! {
        stats = replay(&vardiff, outbound_tx) => stats?,
        _ = sigint.recv() => ReplayStats::default(),
        _ = sigterm.recv() => ReplayStats::default(),
    };

    trace!("Shutting down.");

    // All sessions are gone, so the printer ends once the queue drains.
    tracker.wait().await;

    recorder.flush().await;
    drop(recorder);
    drop(vardiff);
    recorder_handle.await?;

    info!(
        shares = stats.shares,
        skipped = stats.skipped,
        retargets = stats.retargets,
        evicted = stats.evicted,
        workers = store.len().await,
        "Exiting."
    );
    Ok(())
}
