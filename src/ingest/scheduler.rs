// src/ingest/scheduler.rs
//! Periodic reconciliation over every source, plus batched progress writes.
//!
//! A pass only sees what `ChannelClient::recent_messages` returns. With the
//! Telegram adapter that is the buffer of posts the update loop already
//! observed, so a pass retries unconfirmed messages; it does not recover
//! posts the live path never received.
use anyhow::Result;
use metrics::{counter, gauge};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::ingest::progress::write_markers;
use crate::ingest::types::{ChannelClient, SourceId};
use crate::ingest::MessageProcessor;

#[derive(Clone, Copy, Debug)]
pub struct RescanCfg {
    pub interval: Duration,
    /// Shorter sleep after a pass that blew up as a whole.
    pub recovery_sleep: Duration,
    pub fetch_limit: usize,
    /// Pause between sources within one pass.
    pub source_pacing: Duration,
}

impl Default for RescanCfg {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(240),
            recovery_sleep: Duration::from_secs(60),
            fetch_limit: 20,
            source_pacing: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassStats {
    pub sources_ok: usize,
    pub sources_failed: usize,
    pub messages: usize,
}

/// One reconciliation pass over all sources. A fetch error skips only that
/// source. Each batch arrives newest-first and is processed oldest-first so
/// the progress marker climbs one message at a time.
pub async fn run_pass(
    client: &dyn ChannelClient,
    processor: &MessageProcessor,
    sources: &[SourceId],
    cfg: &RescanCfg,
) -> PassStats {
    let mut stats = PassStats::default();

    for (i, &source) in sources.iter().enumerate() {
        if i > 0 && !cfg.source_pacing.is_zero() {
            tokio::time::sleep(cfg.source_pacing).await;
        }

        let mut batch = match client.recent_messages(source, cfg.fetch_limit).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(target: "ingest", source, error = ?e, "could not poll source; skipping");
                counter!("monitor_rescan_errors_total").increment(1);
                processor.stats().rescan_errors.fetch_add(1, Ordering::Relaxed);
                stats.sources_failed += 1;
                continue;
            }
        };

        batch.reverse();
        for msg in batch.iter().filter(|m| m.source == source) {
            processor.process(msg).await;
            stats.messages += 1;
        }
        stats.sources_ok += 1;
    }

    stats
}

/// Poll/sleep loop. Runs until `shutdown` flips; only the sleep is cancellable.
pub fn spawn_rescanner(
    client: Arc<dyn ChannelClient>,
    processor: Arc<MessageProcessor>,
    sources: Vec<SourceId>,
    cfg: RescanCfg,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let sources: Arc<[SourceId]> = sources.into();
    tokio::spawn(async move {
        tracing::info!(target: "ingest", provider = client.name(), "rescanner started");
        loop {
            tracing::info!(target: "ingest", "polling all sources");

            let pass = {
                let client = client.clone();
                let processor = processor.clone();
                let sources = sources.clone();
                tokio::spawn(async move { run_pass(&*client, &processor, &sources, &cfg).await })
            };

            let pause = match pass.await {
                Ok(stats) => {
                    let now = chrono::Utc::now().timestamp().max(0) as u64;
                    gauge!("monitor_rescan_last_run_ts").set(now as f64);
                    processor.stats().rescan_passes.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(
                        target: "ingest",
                        ok = stats.sources_ok,
                        failed = stats.sources_failed,
                        messages = stats.messages,
                        next_in_secs = cfg.interval.as_secs(),
                        "polling pass complete"
                    );
                    cfg.interval
                }
                Err(e) => {
                    tracing::error!(target: "ingest", error = ?e, "polling pass crashed");
                    counter!("monitor_rescan_errors_total").increment(1);
                    processor.stats().rescan_errors.fetch_add(1, Ordering::Relaxed);
                    cfg.recovery_sleep
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = shutdown.changed() => {
                    tracing::info!(target: "ingest", "rescanner stopping");
                    break;
                }
            }
        }
    })
}

/// Write the progress markers if anything changed since the last write.
/// Returns whether a write happened.
pub async fn flush_progress(processor: &MessageProcessor, path: &Path) -> Result<bool> {
    let snapshot = {
        let mut tracker = processor.progress().lock().expect("progress mutex poisoned");
        if !tracker.is_dirty() {
            return Ok(false);
        }
        tracker.take_snapshot()
    };

    if let Err(e) = write_markers(path, &snapshot).await {
        processor
            .progress()
            .lock()
            .expect("progress mutex poisoned")
            .mark_dirty();
        return Err(e);
    }
    tracing::debug!(target: "ingest", sources = snapshot.len(), path = %path.display(), "progress flushed");
    Ok(true)
}

/// Batched persistence: flush every `every`, plus once more on shutdown.
pub fn spawn_progress_flusher(
    processor: Arc<MessageProcessor>,
    path: PathBuf,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            let stopping = tokio::select! {
                _ = ticker.tick() => false,
                _ = shutdown.changed() => true,
            };
            if let Err(e) = flush_progress(&processor, &path).await {
                tracing::warn!(target: "ingest", error = ?e, "progress flush failed");
            }
            if stopping {
                break;
            }
        }
    })
}
