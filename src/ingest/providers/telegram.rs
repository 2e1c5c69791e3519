//! Telegram Bot API adapter for the messaging source and the forward sink.
//!
//! Live posts come from `getUpdates` long polling (`channel_post` updates).
//! The Bot API has no history endpoint, so `recent_messages` and
//! `latest_message_id` are answered from a bounded per-channel buffer of the
//! posts this client has observed.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::ingest::types::{
    ChannelClient, ChannelMessage, ForwardSink, ImageRef, MessageId, SourceId,
};

const API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    #[serde(default)]
    channel_post: Option<Post>,
}

#[derive(Debug, Deserialize)]
struct Post {
    message_id: i64,
    chat: Chat,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    photo: Vec<PhotoSize>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PhotoSize {
    #[serde(default)]
    file_id: Option<String>,
    #[serde(default)]
    file_size: Option<u64>,
}

impl From<Post> for ChannelMessage {
    fn from(p: Post) -> Self {
        // Telegram lists sizes smallest first; keep the largest with a usable id.
        let images = p
            .photo
            .into_iter()
            .rev()
            .find_map(|ps| {
                ps.file_id.filter(|id| !id.is_empty()).map(|file_id| ImageRef {
                    file_id,
                    file_size: ps.file_size.unwrap_or(0),
                })
            })
            .into_iter()
            .collect();

        ChannelMessage {
            source: p.chat.id,
            id: p.message_id,
            text: p.text,
            caption: p.caption,
            images,
            channel_title: p.chat.title,
        }
    }
}

/// Parse a `getUpdates` body into channel posts plus the highest update id.
pub fn parse_updates(body: &str) -> Result<(Vec<ChannelMessage>, Option<i64>)> {
    let env: ApiEnvelope<Vec<Update>> =
        serde_json::from_str(body).context("parsing getUpdates json")?;
    if !env.ok {
        bail!(
            "getUpdates not ok: {}",
            env.description.unwrap_or_default()
        );
    }

    let updates = env.result.unwrap_or_default();
    let max_id = updates.iter().map(|u| u.update_id).max();
    let posts = updates
        .into_iter()
        .filter_map(|u| u.channel_post)
        .map(ChannelMessage::from)
        .collect();
    Ok((posts, max_id))
}

type Buffer = Arc<Mutex<HashMap<SourceId, VecDeque<ChannelMessage>>>>;

#[derive(Clone)]
pub struct TelegramClient {
    base: String,
    forward_target: Option<String>,
    client: reqwest::Client,
    buffer: Buffer,
    buffer_cap: usize,
    poll_timeout_secs: u64,
    primed: Arc<tokio::sync::OnceCell<()>>,
}

impl TelegramClient {
    pub fn new(token: &str) -> Self {
        Self::with_base(format!("{API_BASE}/bot{token}"))
    }

    /// Point at an alternative Bot API server (local bot-api, tests).
    pub fn with_base(base: String) -> Self {
        Self {
            base,
            forward_target: None,
            client: reqwest::Client::new(),
            buffer: Arc::new(Mutex::new(HashMap::new())),
            buffer_cap: 100,
            poll_timeout_secs: 30,
            primed: Arc::new(tokio::sync::OnceCell::new()),
        }
    }

    pub fn with_forward_target(mut self, target: Option<String>) -> Self {
        self.forward_target = target.filter(|t| !t.trim().is_empty());
        self
    }

    pub fn with_buffer_cap(mut self, cap: usize) -> Self {
        self.buffer_cap = cap.max(1);
        self
    }

    pub fn with_poll_timeout(mut self, secs: u64) -> Self {
        self.poll_timeout_secs = secs;
        self
    }

    /// Remember a post for later history queries. Keeps ids unique and ascending.
    pub fn observe(&self, msg: &ChannelMessage) {
        let mut buf = self.buffer.lock().expect("telegram buffer mutex poisoned");
        let q = buf.entry(msg.source).or_default();
        if q.iter().any(|m| m.id == msg.id) {
            return;
        }
        let pos = q.iter().position(|m| m.id > msg.id).unwrap_or(q.len());
        q.insert(pos, msg.clone());
        while q.len() > self.buffer_cap {
            q.pop_front();
        }
    }

    /// Pull pending updates once without confirming them, so history queries
    /// see the backlog before the update loop delivers it.
    async fn prime(&self) {
        self.primed
            .get_or_init(|| async {
                match self.get_updates(None, 0).await {
                    Ok((posts, _)) => {
                        for p in &posts {
                            self.observe(p);
                        }
                        tracing::info!(target: "ingest", backlog = posts.len(), "telegram backlog observed");
                    }
                    Err(e) => tracing::warn!(target: "ingest", error = ?e, "telegram backlog read failed"),
                }
            })
            .await;
    }

    async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout_secs: u64,
    ) -> Result<(Vec<ChannelMessage>, Option<i64>)> {
        let mut query: Vec<(&str, String)> = vec![
            ("timeout", timeout_secs.to_string()),
            ("allowed_updates", r#"["channel_post"]"#.to_string()),
        ];
        if let Some(o) = offset {
            query.push(("offset", o.to_string()));
        }

        let body = self
            .client
            .get(format!("{}/getUpdates", self.base))
            .query(&query)
            .timeout(Duration::from_secs(timeout_secs + 10))
            .send()
            .await
            .context("getUpdates request")?
            .text()
            .await
            .context("getUpdates body")?;
        parse_updates(&body)
    }
}

#[async_trait]
impl ChannelClient for TelegramClient {
    async fn subscribe(&self, sources: &[SourceId]) -> Result<mpsc::Receiver<ChannelMessage>> {
        let (tx, rx) = mpsc::channel(256);
        let wanted: HashSet<SourceId> = sources.iter().copied().collect();
        let this = self.clone();

        tokio::spawn(async move {
            let mut offset: Option<i64> = None;
            loop {
                match this.get_updates(offset, this.poll_timeout_secs).await {
                    Ok((posts, max_id)) => {
                        if let Some(id) = max_id {
                            offset = Some(id + 1);
                        }
                        for post in posts {
                            this.observe(&post);
                            if !wanted.contains(&post.source) {
                                continue;
                            }
                            if tx.send(post).await.is_err() {
                                tracing::info!(target: "ingest", "subscriber gone; stopping update loop");
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(target: "ingest", error = ?e, "getUpdates failed");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn recent_messages(&self, source: SourceId, limit: usize) -> Result<Vec<ChannelMessage>> {
        self.prime().await;
        let buf = self.buffer.lock().expect("telegram buffer mutex poisoned");
        Ok(buf
            .get(&source)
            .map(|q| q.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn latest_message_id(&self, source: SourceId) -> Result<Option<MessageId>> {
        self.prime().await;
        let buf = self.buffer.lock().expect("telegram buffer mutex poisoned");
        Ok(buf.get(&source).and_then(|q| q.back()).map(|m| m.id))
    }

    fn name(&self) -> &'static str {
        "telegram"
    }
}

#[async_trait]
impl ForwardSink for TelegramClient {
    async fn forward(&self, source: SourceId, message_id: MessageId) -> Result<()> {
        let target = self
            .forward_target
            .as_deref()
            .ok_or_else(|| anyhow!("no forward target configured"))?;

        let body = serde_json::json!({
            "chat_id": target,
            "from_chat_id": source,
            "message_id": message_id,
        });
        let text = self
            .client
            .post(format!("{}/forwardMessage", self.base))
            .timeout(Duration::from_secs(15))
            .json(&body)
            .send()
            .await
            .context("forwardMessage request")?
            .text()
            .await
            .context("forwardMessage body")?;

        let env: ApiEnvelope<serde_json::Value> =
            serde_json::from_str(&text).context("parsing forwardMessage json")?;
        if !env.ok {
            bail!(
                "forwardMessage not ok: {}",
                env.description.unwrap_or_default()
            );
        }
        Ok(())
    }
}
