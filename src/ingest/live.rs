// src/ingest/live.rs
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::ingest::types::{ChannelMessage, SourceId};
use crate::ingest::MessageProcessor;

/// Feed pushed messages to the processor one at a time, in arrival order.
/// Messages from sources outside `sources` are dropped. Returns the number
/// of messages processed once the stream closes or shutdown is signalled.
pub async fn run_live(
    mut rx: mpsc::Receiver<ChannelMessage>,
    processor: Arc<MessageProcessor>,
    sources: &[SourceId],
    mut shutdown: watch::Receiver<bool>,
) -> u64 {
    let allowed: HashSet<SourceId> = sources.iter().copied().collect();
    let mut handled = 0u64;
    tracing::info!(target: "ingest", sources = allowed.len(), "live subscription started");

    loop {
        let next = tokio::select! {
            m = rx.recv() => m,
            _ = shutdown.changed() => {
                tracing::info!(target: "ingest", "live subscription stopping");
                break;
            }
        };
        let Some(msg) = next else {
            tracing::warn!(target: "ingest", "live subscription stream closed");
            break;
        };

        if !allowed.contains(&msg.source) {
            tracing::trace!(target: "ingest", source = msg.source, "message from unmonitored source");
            continue;
        }

        let outcome = processor.process(&msg).await;
        tracing::debug!(target: "ingest", source = msg.source, message_id = msg.id, ?outcome, "live message");
        handled += 1;
    }
    handled
}

pub fn spawn_live(
    rx: mpsc::Receiver<ChannelMessage>,
    processor: Arc<MessageProcessor>,
    sources: Vec<SourceId>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<u64> {
    tokio::spawn(async move { run_live(rx, processor, &sources, shutdown).await })
}
