// src/ingest/types.rs
use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Upstream channel identifier (Telegram channel ids are negative i64).
pub type SourceId = i64;

/// Per-source, monotonically increasing message sequence number.
pub type MessageId = i64;

/// A monitored channel. `title` is display-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    pub title: Option<String>,
}

/// Opaque reference to an attached image, as the upstream reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub file_id: String,
    #[serde(default)]
    pub file_size: u64,
}

/// One observed channel message. Read-only once received.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub source: SourceId,
    pub id: MessageId,
    pub text: Option<String>,
    pub caption: Option<String>,
    #[serde(default)]
    pub images: Vec<ImageRef>,
    pub channel_title: Option<String>,
}

impl ChannelMessage {
    /// Caption wins over plain text; empty strings count as absent.
    pub fn content(&self) -> Option<&str> {
        self.caption
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| self.text.as_deref().filter(|s| !s.is_empty()))
    }
}

/// Messaging-source collaborator.
#[async_trait::async_trait]
pub trait ChannelClient: Send + Sync {
    /// Push stream of new messages for `sources`, delivered one at a time.
    async fn subscribe(&self, sources: &[SourceId]) -> Result<mpsc::Receiver<ChannelMessage>>;

    /// Most recent `limit` messages of `source`, newest first.
    async fn recent_messages(&self, source: SourceId, limit: usize)
        -> Result<Vec<ChannelMessage>>;

    /// Current latest message id of `source`, if the source has any.
    async fn latest_message_id(&self, source: SourceId) -> Result<Option<MessageId>>;

    fn name(&self) -> &'static str;
}

/// Forwarding-sink collaborator: relays one message verbatim to the forward target.
#[async_trait::async_trait]
pub trait ForwardSink: Send + Sync {
    async fn forward(&self, source: SourceId, message_id: MessageId) -> Result<()>;
}
