// src/monitor.rs
//! Wires config → pipeline components and owns the background tasks.

use anyhow::{Context, Result};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use metrics::counter;
use tracing::{error, info, warn};

use crate::config::MonitorConfig;
use crate::ingest::dedup::DuplicateFilter;
use crate::ingest::live::spawn_live;
use crate::ingest::progress::{bootstrap_markers, load_markers, ProgressTracker};
use crate::ingest::providers::telegram::TelegramClient;
use crate::ingest::scheduler::{spawn_progress_flusher, spawn_rescanner};
use crate::ingest::types::{ChannelClient, ForwardSink};
use crate::ingest::MessageProcessor;
use crate::notify::{Dispatcher, TokenBotClient};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct Monitor {
    pub cfg: MonitorConfig,
    pub processor: Arc<MessageProcessor>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Monitor {
    /// Production wiring: Telegram for intake + forwarding, HTTP token bot for dispatch.
    pub async fn from_config(cfg: MonitorConfig) -> Result<Self> {
        cfg.validate()?;
        let token = cfg
            .telegram_bot_token
            .clone()
            .context("TELEGRAM_BOT_TOKEN missing")?;

        let telegram = Arc::new(
            TelegramClient::new(&token).with_forward_target(cfg.forward_target.clone()),
        );
        let dispatcher = Arc::new(
            TokenBotClient::new(cfg.token_bot_api_url.clone())
                .with_timeout(cfg.api_timeout_secs)
                .with_retries(cfg.dispatch_attempts)
                .with_retry_delay(Duration::from_secs(cfg.retry_delay_secs)),
        );

        Self::start(cfg, telegram.clone(), telegram, dispatcher).await
    }

    /// Startup order: restore markers → bootstrap missing ones → subscribe →
    /// rescanner → flusher.
    pub async fn start(
        cfg: MonitorConfig,
        client: Arc<dyn ChannelClient>,
        forwarder: Arc<dyn ForwardSink>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<Self> {
        let markers = match load_markers(&cfg.progress_path).await {
            Ok(m) => m,
            Err(e) => {
                warn!(error = ?e, "progress state unreadable; starting fresh");
                Default::default()
            }
        };
        info!(restored = markers.len(), "progress markers loaded");

        let processor = Arc::new(MessageProcessor::new(
            DuplicateFilter::with_window_hours(cfg.dedup_window_hours),
            ProgressTracker::from_markers(markers),
            dispatcher,
            forwarder,
            cfg.processor_settings(),
        ));

        let set = bootstrap_markers(
            processor.progress(),
            client.as_ref(),
            &cfg.channels,
            Duration::from_millis(cfg.source_pacing_ms),
        )
        .await;
        info!(set, "starting points set");

        // Set before any task starts so a crashing one can clear it.
        processor.stats().running.store(true, Ordering::Relaxed);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();

        match client.subscribe(&cfg.channels).await {
            Ok(rx) => {
                let live = spawn_live(rx, processor.clone(), cfg.channels.clone(), shutdown_rx.clone());
                let watched = processor.clone();
                handles.push(tokio::spawn(async move {
                    match live.await {
                        Ok(n) => info!(handled = n, "live handler finished"),
                        Err(e) => {
                            // Intake is down to rescans of whatever was already observed.
                            error!(error = ?e, "live handler crashed; marking monitor stopped");
                            counter!("monitor_live_errors_total").increment(1);
                            let stats = watched.stats();
                            stats.live_errors.fetch_add(1, Ordering::Relaxed);
                            stats.running.store(false, Ordering::Relaxed);
                        }
                    }
                }));
            }
            Err(e) => warn!(error = ?e, "live subscription unavailable; relying on rescans"),
        }

        handles.push(spawn_rescanner(
            client,
            processor.clone(),
            cfg.channels.clone(),
            cfg.rescan_cfg(),
            shutdown_rx.clone(),
        ));
        handles.push(spawn_progress_flusher(
            processor.clone(),
            cfg.progress_path.clone(),
            Duration::from_secs(cfg.flush_interval_secs),
            shutdown_rx,
        ));

        info!(channels = cfg.channels.len(), "monitor running");

        Ok(Self {
            cfg,
            processor,
            shutdown_tx,
            handles,
        })
    }

    /// Signal every task and give each a short grace period (the flusher uses
    /// it for the final write). Tasks stuck in a dispatch are abandoned.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for h in self.handles {
            match tokio::time::timeout(SHUTDOWN_GRACE, h).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = ?e, "monitor task ended abnormally"),
                Err(_) => warn!("monitor task still busy at shutdown; abandoning it"),
            }
        }
        self.processor.stats().running.store(false, Ordering::Relaxed);
        info!("monitor stopped");
    }
}
