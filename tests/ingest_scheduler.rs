// tests/ingest_scheduler.rs
use amazon_link_monitor::ingest::dedup::DuplicateFilter;
use amazon_link_monitor::ingest::live::run_live;
use amazon_link_monitor::ingest::progress::{load_markers, ProgressTracker};
use amazon_link_monitor::ingest::scheduler::{
    flush_progress, run_pass, spawn_rescanner, RescanCfg,
};
use amazon_link_monitor::ingest::types::{
    ChannelClient, ChannelMessage, ForwardSink, MessageId, SourceId,
};
use amazon_link_monitor::notify::ApiResponse;
use amazon_link_monitor::{
    DispatchOutcome, Dispatcher, LinkPayload, MessageProcessor, ProcessorSettings,
};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

#[derive(Default)]
struct CountingDispatcher {
    urls: Mutex<Vec<String>>,
}

#[async_trait]
impl Dispatcher for CountingDispatcher {
    async fn submit(&self, payload: &LinkPayload) -> DispatchOutcome {
        self.urls.lock().unwrap().push(payload.url.clone());
        DispatchOutcome::Accepted(ApiResponse {
            status: "success".into(),
            message: None,
        })
    }

    async fn health_check(&self) -> bool {
        true
    }
}

struct NoForward;

#[async_trait]
impl ForwardSink for NoForward {
    async fn forward(&self, _source: SourceId, _message_id: MessageId) -> Result<()> {
        Ok(())
    }
}

/// Newest-first batches; `broken` sources error; `panic_on_fetch` blows up the whole pass.
#[derive(Default)]
struct ScriptedClient {
    batches: HashMap<SourceId, Vec<ChannelMessage>>,
    broken: Vec<SourceId>,
    panic_on_fetch: bool,
    fetches: AtomicUsize,
}

#[async_trait]
impl ChannelClient for ScriptedClient {
    async fn subscribe(&self, _sources: &[SourceId]) -> Result<mpsc::Receiver<ChannelMessage>> {
        anyhow::bail!("unused")
    }

    async fn recent_messages(&self, source: SourceId, _limit: usize) -> Result<Vec<ChannelMessage>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.panic_on_fetch {
            panic!("session dropped");
        }
        if self.broken.contains(&source) {
            anyhow::bail!("channel private");
        }
        Ok(self.batches.get(&source).cloned().unwrap_or_default())
    }

    async fn latest_message_id(&self, _source: SourceId) -> Result<Option<MessageId>> {
        Ok(None)
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

fn processor(d: Arc<CountingDispatcher>) -> Arc<MessageProcessor> {
    Arc::new(MessageProcessor::new(
        DuplicateFilter::default(),
        ProgressTracker::new(),
        d,
        Arc::new(NoForward),
        ProcessorSettings {
            forward_pacing: Duration::ZERO,
            ..Default::default()
        },
    ))
}

fn deal(source: SourceId, id: MessageId, path: &str) -> ChannelMessage {
    ChannelMessage {
        source,
        id,
        text: Some(format!("today only https://amzn.to/{path}")),
        ..Default::default()
    }
}

fn cfg() -> RescanCfg {
    RescanCfg {
        interval: Duration::from_secs(3600),
        recovery_sleep: Duration::from_secs(3600),
        fetch_limit: 20,
        source_pacing: Duration::ZERO,
    }
}

#[tokio::test]
async fn one_broken_source_does_not_stop_the_pass() {
    let d = Arc::new(CountingDispatcher::default());
    let p = processor(d.clone());
    let client = ScriptedClient {
        batches: HashMap::from([
            (-1, vec![deal(-1, 3, "c"), deal(-1, 2, "b")]),
            (-3, vec![deal(-3, 11, "z")]),
        ]),
        broken: vec![-2],
        ..Default::default()
    };

    let stats = run_pass(&client, &p, &[-1, -2, -3], &cfg()).await;

    assert_eq!(stats.sources_ok, 2);
    assert_eq!(stats.sources_failed, 1);
    // oldest first within a source
    assert_eq!(
        *d.urls.lock().unwrap(),
        vec![
            "https://amzn.to/b".to_string(),
            "https://amzn.to/c".to_string(),
            "https://amzn.to/z".to_string(),
        ]
    );
    assert_eq!(p.marker(-1), 3);
    assert_eq!(p.marker(-3), 11);
    assert_eq!(p.stats().snapshot().rescan_errors, 1);
}

#[tokio::test]
async fn pass_only_sees_the_fetched_window() {
    let d = Arc::new(CountingDispatcher::default());
    let p = processor(d.clone());
    // 2 never reached the client buffer
    let client = ScriptedClient {
        batches: HashMap::from([(-4, vec![deal(-4, 3, "three"), deal(-4, 1, "one")])]),
        ..Default::default()
    };

    run_pass(&client, &p, &[-4], &cfg()).await;

    assert_eq!(
        *d.urls.lock().unwrap(),
        vec![
            "https://amzn.to/one".to_string(),
            "https://amzn.to/three".to_string(),
        ]
    );
    assert_eq!(p.marker(-4), 3);
}

#[tokio::test]
async fn rescanner_stops_promptly_on_shutdown() {
    let d = Arc::new(CountingDispatcher::default());
    let p = processor(d.clone());
    let client = Arc::new(ScriptedClient {
        batches: HashMap::from([(-1, vec![deal(-1, 1, "a")])]),
        ..Default::default()
    });
    let (stop_tx, stop_rx) = watch::channel(false);

    let handle = spawn_rescanner(client.clone(), p.clone(), vec![-1], cfg(), stop_rx);

    for _ in 0..100 {
        if p.stats().snapshot().rescan_passes == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(p.stats().snapshot().rescan_passes, 1);

    stop_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("rescanner did not stop")
        .unwrap();
    assert_eq!(client.fetches.load(Ordering::SeqCst), 1);
    assert_eq!(d.urls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn crashed_pass_is_survived_and_counted() {
    let d = Arc::new(CountingDispatcher::default());
    let p = processor(d);
    let client = Arc::new(ScriptedClient {
        panic_on_fetch: true,
        ..Default::default()
    });
    let (stop_tx, stop_rx) = watch::channel(false);

    let handle = spawn_rescanner(client, p.clone(), vec![-1], cfg(), stop_rx);

    for _ in 0..100 {
        if p.stats().snapshot().rescan_errors >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let snap = p.stats().snapshot();
    assert_eq!(snap.rescan_errors, 1);
    assert_eq!(snap.rescan_passes, 0);

    stop_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("rescanner did not stop")
        .unwrap();
}

#[tokio::test]
async fn live_handler_filters_sources_and_keeps_order() {
    let d = Arc::new(CountingDispatcher::default());
    let p = processor(d.clone());
    let (tx, rx) = mpsc::channel(8);
    let (_stop_tx, stop_rx) = watch::channel(false);

    tx.send(deal(-1, 1, "first")).await.unwrap();
    tx.send(deal(-9, 1, "unmonitored")).await.unwrap();
    tx.send(deal(-1, 2, "second")).await.unwrap();
    drop(tx);

    let handled = run_live(rx, p.clone(), &[-1], stop_rx).await;

    assert_eq!(handled, 2);
    assert_eq!(
        *d.urls.lock().unwrap(),
        vec![
            "https://amzn.to/first".to_string(),
            "https://amzn.to/second".to_string(),
        ]
    );
    assert_eq!(p.marker(-1), 2);
    assert_eq!(p.marker(-9), 0);
}

#[tokio::test]
async fn live_and_rescan_never_double_dispatch() {
    let d = Arc::new(CountingDispatcher::default());
    let p = processor(d.clone());
    let client = ScriptedClient {
        batches: HashMap::from([(-1, vec![deal(-1, 5, "same")])]),
        ..Default::default()
    };
    let (tx, rx) = mpsc::channel(1);
    let (_stop_tx, stop_rx) = watch::channel(false);
    tx.send(deal(-1, 5, "same")).await.unwrap();
    drop(tx);

    let live = run_live(rx, p.clone(), &[-1], stop_rx);
    let pass_cfg = cfg();
    let pass = run_pass(&client, &p, &[-1], &pass_cfg);
    tokio::join!(live, pass);

    assert_eq!(d.urls.lock().unwrap().len(), 1);
    assert_eq!(p.marker(-1), 5);
}

#[tokio::test]
async fn flush_writes_only_when_dirty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("progress.json");
    let d = Arc::new(CountingDispatcher::default());
    let p = processor(d);

    assert!(!flush_progress(&p, &path).await.unwrap());

    p.process(&deal(-7, 4, "x")).await;
    assert!(flush_progress(&p, &path).await.unwrap());
    assert!(!flush_progress(&p, &path).await.unwrap());

    let on_disk = load_markers(&path).await.unwrap();
    assert_eq!(on_disk.get(&-7), Some(&4));
}
