pub mod token_bot;

use serde::{Deserialize, Serialize};

use crate::ingest::types::{ChannelMessage, ImageRef, MessageId, SourceId};

pub use token_bot::TokenBotClient;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub channel_id: SourceId,
    pub message_id: MessageId,
    pub channel_title: String,
}

/// Body POSTed to the processing API for one target-domain link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkPayload {
    pub url: String,
    pub original_text: String,
    pub images: Vec<ImageRef>,
    pub channel_info: ChannelInfo,
}

impl LinkPayload {
    pub fn from_message(url: &str, text: &str, msg: &ChannelMessage) -> Self {
        Self {
            url: url.to_string(),
            original_text: text.to_string(),
            images: msg
                .images
                .iter()
                .filter(|i| !i.file_id.is_empty())
                .cloned()
                .collect(),
            channel_info: ChannelInfo {
                channel_id: msg.source,
                message_id: msg.id,
                channel_title: msg
                    .channel_title
                    .clone()
                    .unwrap_or_else(|| "Unknown".to_string()),
            },
        }
    }
}

/// What the processing API answered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiResponse {
    #[serde(default = "unknown_status")]
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

fn unknown_status() -> String {
    "unknown".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// 2xx, processed (or at least not refused).
    Accepted(ApiResponse),
    /// 2xx, remote already has this link.
    Duplicate(ApiResponse),
    /// 2xx, remote answered with an explicit error status. Not retried.
    Rejected(ApiResponse),
    /// No confirmation: retries exhausted or nothing configured.
    Failed,
}

impl DispatchOutcome {
    /// Whether the remote now knows about the link.
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Accepted(_) | Self::Duplicate(_))
    }

    pub fn from_response(rsp: ApiResponse) -> Self {
        match rsp.status.to_ascii_lowercase().as_str() {
            "duplicate" => Self::Duplicate(rsp),
            "error" | "failed" => Self::Rejected(rsp),
            _ => Self::Accepted(rsp),
        }
    }
}

/// Outbound sink for target-domain links.
#[async_trait::async_trait]
pub trait Dispatcher: Send + Sync {
    /// Never errors: failures surface as `DispatchOutcome::Failed`.
    async fn submit(&self, payload: &LinkPayload) -> DispatchOutcome;

    async fn health_check(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_shape_matches_api_contract() {
        let msg = ChannelMessage {
            source: -100,
            id: 9,
            text: Some("check this https://amzn.to/abc".into()),
            caption: None,
            images: vec![
                ImageRef {
                    file_id: "AgAD".into(),
                    file_size: 1234,
                },
                ImageRef {
                    file_id: String::new(),
                    file_size: 0,
                },
            ],
            channel_title: None,
        };
        let p = LinkPayload::from_message("https://amzn.to/abc", "check this https://amzn.to/abc", &msg);
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["url"], "https://amzn.to/abc");
        assert_eq!(v["images"].as_array().unwrap().len(), 1);
        assert_eq!(v["images"][0]["file_size"], 1234);
        assert_eq!(v["channel_info"]["channel_id"], -100);
        assert_eq!(v["channel_info"]["message_id"], 9);
        assert_eq!(v["channel_info"]["channel_title"], "Unknown");
    }

    #[test]
    fn status_mapping() {
        let mk = |s: &str| ApiResponse {
            status: s.into(),
            message: None,
        };
        assert!(matches!(DispatchOutcome::from_response(mk("success")), DispatchOutcome::Accepted(_)));
        assert!(matches!(DispatchOutcome::from_response(mk("Duplicate")), DispatchOutcome::Duplicate(_)));
        assert!(matches!(DispatchOutcome::from_response(mk("error")), DispatchOutcome::Rejected(_)));
        assert!(!DispatchOutcome::Failed.is_confirmed());
        let parsed: ApiResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed.status, "unknown");
    }
}
