// src/config/monitor.rs
use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ingest::classify::DEFAULT_MIN_TEXT_LEN;
use crate::ingest::progress::DEFAULT_PROGRESS_PATH;
use crate::ingest::scheduler::RescanCfg;
use crate::ingest::types::SourceId;
use crate::ingest::ProcessorSettings;

pub const DEFAULT_MONITOR_CONFIG_PATH: &str = "config/monitor.toml";
pub const ENV_MONITOR_CONFIG_PATH: &str = "MONITOR_CONFIG_PATH";

fn default_dedup_window_hours() -> i64 {
    48
}
fn default_rescan_interval_secs() -> u64 {
    240
}
fn default_recovery_sleep_secs() -> u64 {
    60
}
fn default_fetch_limit() -> usize {
    20
}
fn default_api_timeout_secs() -> u64 {
    30
}
fn default_dispatch_attempts() -> u8 {
    3
}
fn default_retry_delay_secs() -> u64 {
    5
}
fn default_forward_pacing_ms() -> u64 {
    3_000
}
fn default_source_pacing_ms() -> u64 {
    1_000
}
fn default_flush_interval_secs() -> u64 {
    30
}
fn default_min_text_len() -> usize {
    DEFAULT_MIN_TEXT_LEN
}
fn default_progress_path() -> PathBuf {
    PathBuf::from(DEFAULT_PROGRESS_PATH)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Monitored channel ids.
    #[serde(default)]
    pub channels: Vec<SourceId>,
    /// Processing API endpoint (e.g. `https://host/api/process`).
    #[serde(default)]
    pub token_bot_api_url: Option<String>,
    /// Where non-target messages get forwarded (`@username` or chat id).
    #[serde(default)]
    pub forward_target: Option<String>,
    #[serde(default)]
    pub telegram_bot_token: Option<String>,

    #[serde(default = "default_dedup_window_hours")]
    pub dedup_window_hours: i64,
    #[serde(default = "default_rescan_interval_secs")]
    pub rescan_interval_secs: u64,
    #[serde(default = "default_recovery_sleep_secs")]
    pub recovery_sleep_secs: u64,
    #[serde(default = "default_fetch_limit")]
    pub fetch_limit: usize,
    #[serde(default = "default_api_timeout_secs")]
    pub api_timeout_secs: u64,
    #[serde(default = "default_dispatch_attempts")]
    pub dispatch_attempts: u8,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_forward_pacing_ms")]
    pub forward_pacing_ms: u64,
    #[serde(default = "default_source_pacing_ms")]
    pub source_pacing_ms: u64,
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    #[serde(default = "default_min_text_len")]
    pub min_text_len: usize,
    #[serde(default = "default_progress_path")]
    pub progress_path: PathBuf,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            token_bot_api_url: None,
            forward_target: None,
            telegram_bot_token: None,
            dedup_window_hours: default_dedup_window_hours(),
            rescan_interval_secs: default_rescan_interval_secs(),
            recovery_sleep_secs: default_recovery_sleep_secs(),
            fetch_limit: default_fetch_limit(),
            api_timeout_secs: default_api_timeout_secs(),
            dispatch_attempts: default_dispatch_attempts(),
            retry_delay_secs: default_retry_delay_secs(),
            forward_pacing_ms: default_forward_pacing_ms(),
            source_pacing_ms: default_source_pacing_ms(),
            flush_interval_secs: default_flush_interval_secs(),
            min_text_len: default_min_text_len(),
            progress_path: default_progress_path(),
        }
    }
}

/// Parse `CHANNELS`-style lists: comma separated integers, blanks ignored.
pub fn parse_channel_list(s: &str) -> Result<Vec<SourceId>> {
    let mut out = Vec::new();
    for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let id: SourceId = part
            .parse()
            .map_err(|_| anyhow!("channel id `{part}` is not an integer"))?;
        if !out.contains(&id) {
            out.push(id);
        }
    }
    Ok(out)
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match env_nonempty(name) {
        Some(v) => v
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| anyhow!("{name}=`{v}` is not a valid value")),
        None => Ok(None),
    }
}

impl MonitorConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: MonitorConfig = toml::from_str(s).context("parsing monitor config toml")?;
        Ok(cfg)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading monitor config from {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// File (if any) then environment overrides:
    /// 1) $MONITOR_CONFIG_PATH (must exist when set)
    /// 2) config/monitor.toml
    /// 3) built-in defaults
    pub fn load() -> Result<Self> {
        let mut cfg = if let Some(p) = env_nonempty(ENV_MONITOR_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                bail!("{ENV_MONITOR_CONFIG_PATH} points to non-existent path");
            }
            Self::load_from_file(&pb)?
        } else {
            let default = PathBuf::from(DEFAULT_MONITOR_CONFIG_PATH);
            if default.exists() {
                Self::load_from_file(&default)?
            } else {
                Self::default()
            }
        };
        cfg.apply_env()?;
        cfg.sanitize();
        Ok(cfg)
    }

    /// Environment names follow the deployed bot's `.env`.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = env_nonempty("CHANNELS") {
            self.channels = parse_channel_list(&v)?;
        }
        if let Some(v) = env_nonempty("TOKEN_BOT_API_URL") {
            self.token_bot_api_url = Some(v);
        }
        if let Some(v) = env_nonempty("EARNKARO_BOT_USERNAME") {
            self.forward_target = Some(v);
        }
        if let Some(v) = env_nonempty("TELEGRAM_BOT_TOKEN") {
            self.telegram_bot_token = Some(v);
        }
        if let Some(v) = env_parse("POLLING_MESSAGE_LIMIT")? {
            self.fetch_limit = v;
        }
        if let Some(v) = env_parse("API_TIMEOUT")? {
            self.api_timeout_secs = v;
        }
        if let Some(v) = env_parse("DEDUP_WINDOW_HOURS")? {
            self.dedup_window_hours = v;
        }
        if let Some(v) = env_parse("RESCAN_INTERVAL_SECS")? {
            self.rescan_interval_secs = v;
        }
        if let Some(v) = env_parse("RECOVERY_SLEEP_SECS")? {
            self.recovery_sleep_secs = v;
        }
        if let Some(v) = env_parse("MIN_TEXT_LEN")? {
            self.min_text_len = v;
        }
        if let Some(v) = env_nonempty("PROGRESS_STATE_PATH") {
            self.progress_path = PathBuf::from(v);
        }
        Ok(())
    }

    fn sanitize(&mut self) {
        if self.dedup_window_hours <= 0 {
            self.dedup_window_hours = default_dedup_window_hours();
        }
        if self.fetch_limit == 0 {
            self.fetch_limit = default_fetch_limit();
        }
        if self.dispatch_attempts == 0 {
            self.dispatch_attempts = 1;
        }
        if self.rescan_interval_secs == 0 {
            self.rescan_interval_secs = default_rescan_interval_secs();
        }
        // Recovery must stay shorter than the regular cycle.
        if self.recovery_sleep_secs == 0 || self.recovery_sleep_secs >= self.rescan_interval_secs {
            self.recovery_sleep_secs = (self.rescan_interval_secs / 4).max(1);
        }
        if self.flush_interval_secs == 0 {
            self.flush_interval_secs = default_flush_interval_secs();
        }
    }

    /// Startup checks for what the pipeline cannot run without.
    pub fn validate(&self) -> Result<()> {
        if self.channels.is_empty() {
            bail!("no channels configured (CHANNELS)");
        }
        if self.telegram_bot_token.is_none() {
            bail!("TELEGRAM_BOT_TOKEN missing");
        }
        if self.token_bot_api_url.is_none() {
            tracing::warn!("TOKEN_BOT_API_URL missing; target links will not be dispatched");
        }
        if self.forward_target.is_none() {
            tracing::warn!("EARNKARO_BOT_USERNAME missing; forwards will fail");
        }
        for id in &self.channels {
            if *id >= 0 {
                tracing::warn!(channel = id, "channel id is not negative; is it really a channel?");
            }
        }
        Ok(())
    }

    pub fn rescan_cfg(&self) -> RescanCfg {
        RescanCfg {
            interval: Duration::from_secs(self.rescan_interval_secs),
            recovery_sleep: Duration::from_secs(self.recovery_sleep_secs),
            fetch_limit: self.fetch_limit,
            source_pacing: Duration::from_millis(self.source_pacing_ms),
        }
    }

    pub fn processor_settings(&self) -> ProcessorSettings {
        ProcessorSettings {
            min_text_len: self.min_text_len,
            forward_pacing: Duration::from_millis(self.forward_pacing_ms),
        }
    }
}
