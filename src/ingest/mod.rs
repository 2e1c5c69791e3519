// src/ingest/mod.rs
pub mod classify;
pub mod dedup;
pub mod live;
pub mod normalize;
pub mod progress;
pub mod providers;
pub mod scheduler;
pub mod types;

use chrono::Utc;
use metrics::{counter, describe_counter, describe_gauge};
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::ingest::classify::{partition, DEFAULT_MIN_TEXT_LEN};
use crate::ingest::dedup::DuplicateFilter;
use crate::ingest::normalize::{normalize_url, text_key};
use crate::ingest::progress::ProgressTracker;
use crate::ingest::types::{ChannelMessage, ForwardSink, SourceId};
use crate::notify::{DispatchOutcome, Dispatcher, LinkPayload};

/// One-time metrics registration (so series show up on /metrics).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("monitor_messages_total", "Messages handed to the processor.");
        describe_counter!(
            "monitor_messages_skipped_total",
            "Messages at or below the source progress marker."
        );
        describe_counter!(
            "monitor_links_dispatched_total",
            "Target-domain links confirmed by the processing API."
        );
        describe_counter!(
            "monitor_links_duplicate_total",
            "Links or texts dropped by the dedup window."
        );
        describe_counter!("monitor_forwards_total", "Messages forwarded to the forward target.");
        describe_counter!(
            "monitor_dispatch_failures_total",
            "Links the processing API did not confirm."
        );
        describe_counter!(
            "monitor_rescan_errors_total",
            "Per-source fetch errors and failed rescan passes."
        );
        describe_counter!(
            "monitor_links_rejected_total",
            "Links the processing API answered with an error status."
        );
        describe_counter!(
            "monitor_live_errors_total",
            "Live subscription handlers that ended abnormally."
        );
        describe_gauge!(
            "monitor_rescan_last_run_ts",
            "Unix ts when the rescanner last completed a pass."
        );
    });
}

#[derive(Debug, Clone, Copy)]
pub struct ProcessorSettings {
    pub min_text_len: usize,
    /// Pause after each forward, to respect upstream rate limits.
    pub forward_pacing: Duration,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            min_text_len: DEFAULT_MIN_TEXT_LEN,
            forward_pacing: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Already covered by the progress marker; nothing happened.
    Skipped,
    /// No text or no links; the message is still marked as seen.
    NoLinks,
    /// Contained a non-target link; sent whole to the forward target.
    Forwarded { ok: bool },
    /// Forward path, but the same text went out inside the window.
    ForwardDuplicate,
    /// `rejected` links got a definitive error from the API and are not
    /// retried; `failed` links hold the marker for a later rescan.
    Dispatched {
        sent: usize,
        duplicates: usize,
        rejected: usize,
        failed: usize,
    },
}

impl ProcessOutcome {
    /// Whether some link still waits for a confirmed dispatch.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Dispatched { failed, .. } if *failed > 0)
    }
}

/// Counters behind the status endpoint.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub running: AtomicBool,
    pub messages: AtomicU64,
    pub skipped: AtomicU64,
    pub dispatched: AtomicU64,
    pub duplicates: AtomicU64,
    pub forwarded: AtomicU64,
    pub failures: AtomicU64,
    pub rejected: AtomicU64,
    pub rescan_passes: AtomicU64,
    pub rescan_errors: AtomicU64,
    pub live_errors: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub running: bool,
    pub messages: u64,
    pub skipped: u64,
    pub dispatched: u64,
    pub duplicates: u64,
    pub forwarded: u64,
    pub failures: u64,
    pub rejected: u64,
    pub rescan_passes: u64,
    pub rescan_errors: u64,
    pub live_errors: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let g = |a: &AtomicU64| a.load(Ordering::Relaxed);
        StatsSnapshot {
            running: self.running.load(Ordering::Relaxed),
            messages: g(&self.messages),
            skipped: g(&self.skipped),
            dispatched: g(&self.dispatched),
            duplicates: g(&self.duplicates),
            forwarded: g(&self.forwarded),
            failures: g(&self.failures),
            rejected: g(&self.rejected),
            rescan_passes: g(&self.rescan_passes),
            rescan_errors: g(&self.rescan_errors),
            live_errors: g(&self.live_errors),
        }
    }

    fn bump(a: &AtomicU64, n: u64) {
        a.fetch_add(n, Ordering::Relaxed);
    }
}

/// Decides, per message, what to dispatch or forward.
///
/// Shared by the live handler and the rescanner. Messages of one source are
/// processed one at a time (per-source async lock); the dedup filter and the
/// progress tracker sit behind short-lived std mutexes never held across an
/// await.
///
/// A failed dispatch holds the source's marker below that message, so newer
/// messages are handled but the failed one stays eligible for the next
/// rescan.
pub struct MessageProcessor {
    dedup: Mutex<DuplicateFilter>,
    progress: Mutex<ProgressTracker>,
    dispatcher: Arc<dyn Dispatcher>,
    forwarder: Arc<dyn ForwardSink>,
    settings: ProcessorSettings,
    stats: Arc<PipelineStats>,
    source_locks: Mutex<HashMap<SourceId, Arc<tokio::sync::Mutex<()>>>>,
}

impl MessageProcessor {
    pub fn new(
        dedup: DuplicateFilter,
        progress: ProgressTracker,
        dispatcher: Arc<dyn Dispatcher>,
        forwarder: Arc<dyn ForwardSink>,
        settings: ProcessorSettings,
    ) -> Self {
        ensure_metrics_described();
        Self {
            dedup: Mutex::new(dedup),
            progress: Mutex::new(progress),
            dispatcher,
            forwarder,
            settings,
            stats: Arc::new(PipelineStats::default()),
            source_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    pub fn progress(&self) -> &Mutex<ProgressTracker> {
        &self.progress
    }

    pub fn dispatcher(&self) -> &Arc<dyn Dispatcher> {
        &self.dispatcher
    }

    pub fn marker(&self, source: SourceId) -> i64 {
        self.progress
            .lock()
            .expect("progress mutex poisoned")
            .marker(source)
    }

    pub fn dedup_len(&self) -> usize {
        self.dedup.lock().expect("dedup mutex poisoned").len()
    }

    fn source_lock(&self, source: SourceId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.source_locks.lock().expect("source locks mutex poisoned");
        locks.entry(source).or_default().clone()
    }

    fn is_duplicate(&self, key: &str) -> bool {
        self.dedup
            .lock()
            .expect("dedup mutex poisoned")
            .is_duplicate(key, Utc::now())
    }

    fn mark_processed(&self, key: &str) {
        self.dedup
            .lock()
            .expect("dedup mutex poisoned")
            .mark_as_processed(key, Utc::now());
    }

    fn settle(&self, source: SourceId, seq: i64, confirmed: bool) -> bool {
        self.progress
            .lock()
            .expect("progress mutex poisoned")
            .settle(source, seq, confirmed)
    }

    /// Handle one message end to end. Never fails; problems are logged.
    pub async fn process(&self, msg: &ChannelMessage) -> ProcessOutcome {
        // Per source only: two sources carrying the same product key can both
        // pass the dedup check before either dispatch is confirmed.
        let lock = self.source_lock(msg.source);
        let _guard = lock.lock().await;

        let skip = self
            .progress
            .lock()
            .expect("progress mutex poisoned")
            .should_skip(msg.source, msg.id);
        if skip {
            counter!("monitor_messages_skipped_total").increment(1);
            PipelineStats::bump(&self.stats.skipped, 1);
            return ProcessOutcome::Skipped;
        }

        counter!("monitor_messages_total").increment(1);
        PipelineStats::bump(&self.stats.messages, 1);

        let outcome = self.route(msg).await;
        let pending = outcome.is_pending();
        let advanced = self.settle(msg.source, msg.id, !pending);
        if pending {
            tracing::warn!(
                target: "ingest",
                source = msg.source,
                message_id = msg.id,
                "dispatch unconfirmed; progress marker held for retry"
            );
        } else if !advanced {
            tracing::debug!(
                target: "ingest",
                source = msg.source,
                message_id = msg.id,
                "handled behind an older unconfirmed message"
            );
        }
        outcome
    }

    async fn route(&self, msg: &ChannelMessage) -> ProcessOutcome {
        let Some(text) = msg.content() else {
            return ProcessOutcome::NoLinks;
        };

        let links = partition(Some(text), self.settings.min_text_len);
        if links.is_empty() {
            return ProcessOutcome::NoLinks;
        }

        // Any non-target link routes the whole message to forwarding.
        if !links.other.is_empty() {
            return self.forward(msg, text).await;
        }

        let mut sent = 0usize;
        let mut duplicates = 0usize;
        let mut rejected = 0usize;
        let mut failed = 0usize;

        for url in &links.target {
            let key = normalize_url(url);
            if self.is_duplicate(&key) {
                tracing::debug!(target: "ingest", %key, "duplicate link skipped");
                counter!("monitor_links_duplicate_total").increment(1);
                duplicates += 1;
                continue;
            }

            let payload = LinkPayload::from_message(url, text, msg);
            let outcome = self.dispatcher.submit(&payload).await;
            match &outcome {
                DispatchOutcome::Accepted(_) => {
                    self.mark_processed(&key);
                    counter!("monitor_links_dispatched_total").increment(1);
                    sent += 1;
                }
                DispatchOutcome::Duplicate(_) => {
                    self.mark_processed(&key);
                    counter!("monitor_links_duplicate_total").increment(1);
                    duplicates += 1;
                }
                // Definitive answer: not retried, key left unmarked.
                DispatchOutcome::Rejected(rsp) => {
                    tracing::warn!(target: "ingest", %key, status = %rsp.status, "api rejected link");
                    counter!("monitor_links_rejected_total").increment(1);
                    rejected += 1;
                }
                DispatchOutcome::Failed => {
                    counter!("monitor_dispatch_failures_total").increment(1);
                    failed += 1;
                }
            }
        }

        PipelineStats::bump(&self.stats.dispatched, sent as u64);
        PipelineStats::bump(&self.stats.duplicates, duplicates as u64);
        PipelineStats::bump(&self.stats.rejected, rejected as u64);
        PipelineStats::bump(&self.stats.failures, failed as u64);

        tracing::info!(
            target: "ingest",
            source = msg.source,
            message_id = msg.id,
            sent,
            duplicates,
            rejected,
            failed,
            "target links handled"
        );

        ProcessOutcome::Dispatched {
            sent,
            duplicates,
            rejected,
            failed,
        }
    }

    /// Forward-once: the text key is reserved before sending and a failed
    /// forward is not retried.
    async fn forward(&self, msg: &ChannelMessage, text: &str) -> ProcessOutcome {
        let key = text_key(text);
        if self.is_duplicate(&key) {
            counter!("monitor_links_duplicate_total").increment(1);
            PipelineStats::bump(&self.stats.duplicates, 1);
            return ProcessOutcome::ForwardDuplicate;
        }
        self.mark_processed(&key);

        let ok = match self.forwarder.forward(msg.source, msg.id).await {
            Ok(()) => {
                counter!("monitor_forwards_total").increment(1);
                PipelineStats::bump(&self.stats.forwarded, 1);
                tracing::info!(target: "ingest", source = msg.source, message_id = msg.id, "message forwarded");
                true
            }
            Err(e) => {
                PipelineStats::bump(&self.stats.failures, 1);
                tracing::error!(
                    target: "ingest",
                    source = msg.source,
                    message_id = msg.id,
                    error = ?e,
                    "forward failed"
                );
                false
            }
        };

        if !self.settings.forward_pacing.is_zero() {
            tokio::time::sleep(self.settings.forward_pacing).await;
        }
        ProcessOutcome::Forwarded { ok }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::types::{MessageId, SourceId};
    use crate::notify::ApiResponse;

    struct OkDispatcher(AtomicU64);

    #[async_trait::async_trait]
    impl Dispatcher for OkDispatcher {
        async fn submit(&self, _payload: &LinkPayload) -> DispatchOutcome {
            self.0.fetch_add(1, Ordering::SeqCst);
            DispatchOutcome::Accepted(ApiResponse {
                status: "success".into(),
                message: None,
            })
        }
        async fn health_check(&self) -> bool {
            true
        }
    }

    struct NoopForward;

    #[async_trait::async_trait]
    impl ForwardSink for NoopForward {
        async fn forward(&self, _s: SourceId, _m: MessageId) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn processor() -> (MessageProcessor, Arc<OkDispatcher>) {
        let d = Arc::new(OkDispatcher(AtomicU64::new(0)));
        let p = MessageProcessor::new(
            DuplicateFilter::default(),
            ProgressTracker::new(),
            d.clone(),
            Arc::new(NoopForward),
            ProcessorSettings {
                forward_pacing: Duration::ZERO,
                ..Default::default()
            },
        );
        (p, d)
    }

    fn msg(id: i64, text: &str) -> ChannelMessage {
        ChannelMessage {
            source: 7,
            id,
            text: Some(text.into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn same_product_in_two_messages_is_sent_once() {
        let (p, d) = processor();
        let a = p
            .process(&msg(1, "deal https://amazon.in/dp/B0ABCDEFGH?tag=x"))
            .await;
        let b = p
            .process(&msg(2, "again https://www.amazon.in/gp/product/B0ABCDEFGH"))
            .await;
        assert_eq!(
            a,
            ProcessOutcome::Dispatched { sent: 1, duplicates: 0, rejected: 0, failed: 0 }
        );
        assert_eq!(
            b,
            ProcessOutcome::Dispatched { sent: 0, duplicates: 1, rejected: 0, failed: 0 }
        );
        assert_eq!(d.0.load(Ordering::SeqCst), 1);
        assert_eq!(p.marker(7), 2);
    }

    #[tokio::test]
    async fn replayed_message_is_skipped() {
        let (p, d) = processor();
        p.process(&msg(5, "deal https://amzn.to/abc")).await;
        assert_eq!(p.process(&msg(5, "deal https://amzn.to/abc")).await, ProcessOutcome::Skipped);
        assert_eq!(p.process(&msg(4, "deal https://amzn.to/zzz")).await, ProcessOutcome::Skipped);
        assert_eq!(d.0.load(Ordering::SeqCst), 1);
        assert_eq!(p.stats().snapshot().skipped, 2);
    }
}
