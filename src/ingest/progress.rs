// src/ingest/progress.rs
//! Per-source high-water mark of handled message ids, with JSON persistence.

use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ingest::types::{ChannelClient, MessageId, SourceId};

pub const DEFAULT_PROGRESS_PATH: &str = "state/progress.json";

/// Markers never decrease. Zero is the "nothing handled yet" sentinel.
///
/// A source can also carry a hold: the oldest message whose dispatch was not
/// confirmed. While held, the marker does not move past it. Holds live in
/// memory only; after a restart the unmoved marker has the same effect.
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    markers: HashMap<SourceId, MessageId>,
    held: HashMap<SourceId, MessageId>,
    dirty: bool,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_markers(markers: HashMap<SourceId, MessageId>) -> Self {
        Self {
            markers,
            held: HashMap::new(),
            dirty: false,
        }
    }

    pub fn marker(&self, source: SourceId) -> MessageId {
        self.markers.get(&source).copied().unwrap_or(0)
    }

    pub fn has_marker(&self, source: SourceId) -> bool {
        self.markers.contains_key(&source)
    }

    pub fn should_skip(&self, source: SourceId, seq: MessageId) -> bool {
        seq <= self.marker(source)
    }

    /// Raise the marker to `seq`. Returns false (no-op) if `seq` is not newer.
    pub fn advance(&mut self, source: SourceId, seq: MessageId) -> bool {
        if seq <= self.marker(source) {
            return false;
        }
        self.markers.insert(source, seq);
        self.dirty = true;
        true
    }

    pub fn held(&self, source: SourceId) -> Option<MessageId> {
        self.held.get(&source).copied()
    }

    /// Record the result of handling `seq`. An unconfirmed message places
    /// (or lowers) the hold; a confirmed one releases its own hold and
    /// advances unless an older hold is still pending. Returns whether the
    /// marker moved.
    pub fn settle(&mut self, source: SourceId, seq: MessageId, confirmed: bool) -> bool {
        if !confirmed {
            let h = self.held.entry(source).or_insert(seq);
            *h = (*h).min(seq);
            return false;
        }
        if self.held.get(&source) == Some(&seq) {
            self.held.remove(&source);
        }
        match self.held.get(&source) {
            Some(&h) if seq > h => false,
            _ => self.advance(source, seq),
        }
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Copy of the markers for writing; clears the dirty flag.
    pub fn take_snapshot(&mut self) -> BTreeMap<SourceId, MessageId> {
        self.dirty = false;
        self.snapshot()
    }

    pub fn snapshot(&self) -> BTreeMap<SourceId, MessageId> {
        self.markers.iter().map(|(k, v)| (*k, *v)).collect()
    }

    /// Mark dirty again after a failed write so the next flush retries.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}

/// Parse the persisted JSON object. Keys are decimal source ids; other keys are skipped.
pub fn parse_markers(s: &str) -> Result<HashMap<SourceId, MessageId>> {
    let raw: HashMap<String, MessageId> =
        serde_json::from_str(s).context("parsing progress json")?;

    let mut out = HashMap::with_capacity(raw.len());
    for (k, v) in raw {
        match k.trim().parse::<SourceId>() {
            Ok(id) => {
                out.insert(id, v);
            }
            Err(_) => tracing::warn!(target: "ingest", key = %k, "ignoring non-numeric progress key"),
        }
    }
    Ok(out)
}

/// Load persisted markers. A missing file yields an empty map.
pub async fn load_markers(path: &Path) -> Result<HashMap<SourceId, MessageId>> {
    match tokio::fs::read_to_string(path).await {
        Ok(s) => parse_markers(&s),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(e) => Err(e).with_context(|| format!("reading progress from {}", path.display())),
    }
}

/// Whole-file overwrite via a sibling temp file + rename.
pub async fn write_markers(path: &Path, markers: &BTreeMap<SourceId, MessageId>) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
    }

    let as_strings: BTreeMap<String, MessageId> =
        markers.iter().map(|(k, v)| (k.to_string(), *v)).collect();
    let body = serde_json::to_vec_pretty(&as_strings).context("serializing progress")?;

    let tmp = tmp_path(path);
    tokio::fs::write(&tmp, body)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("renaming onto {}", path.display()))?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Cold start: give every source without a marker its current latest id,
/// so history is not replayed. Returns how many markers were set.
pub async fn bootstrap_markers(
    tracker: &std::sync::Mutex<ProgressTracker>,
    client: &dyn ChannelClient,
    sources: &[SourceId],
    pacing: Duration,
) -> usize {
    let mut set = 0usize;
    for &source in sources {
        let known = tracker
            .lock()
            .expect("progress mutex poisoned")
            .has_marker(source);
        if known {
            continue;
        }

        match client.latest_message_id(source).await {
            Ok(Some(latest)) => {
                tracker
                    .lock()
                    .expect("progress mutex poisoned")
                    .advance(source, latest);
                set += 1;
                tracing::info!(target: "ingest", source, latest, "starting point set");
            }
            Ok(None) => {
                tracing::info!(target: "ingest", source, "source has no messages yet");
            }
            Err(e) => {
                tracing::error!(target: "ingest", source, error = ?e, "could not read latest message; source starts from zero");
            }
        }

        if !pacing.is_zero() {
            tokio::time::sleep(pacing).await;
        }
    }
    set
}
