// src/ingest/dedup.rs
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;

pub const DEFAULT_WINDOW_HOURS: i64 = 48;

/// Time-windowed "seen recently" set keyed by normalized link or text key.
/// - `is_duplicate` only reads (plus throttled eviction); it never records.
/// - `mark_as_processed` records acceptance, after the caller's step succeeded.
/// - An entry older than the window counts as absent even before eviction.
#[derive(Debug, Clone)]
pub struct DuplicateFilter {
    window: ChronoDuration,
    seen: HashMap<String, DateTime<Utc>>,
    last_cleanup: Option<DateTime<Utc>>,
}

impl Default for DuplicateFilter {
    fn default() -> Self {
        Self::with_window_hours(DEFAULT_WINDOW_HOURS)
    }
}

impl DuplicateFilter {
    /// Non-positive windows are clamped to one second.
    pub fn new(window: ChronoDuration) -> Self {
        let window = if window <= ChronoDuration::zero() {
            ChronoDuration::seconds(1)
        } else {
            window
        };
        Self {
            window,
            seen: HashMap::new(),
            last_cleanup: None,
        }
    }

    pub fn with_window_hours(hours: i64) -> Self {
        Self::new(ChronoDuration::hours(hours))
    }

    pub fn window(&self) -> ChronoDuration {
        self.window
    }

    /// Physically stored entries, expired ones included until the next cleanup.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn is_duplicate(&mut self, key: &str, now: DateTime<Utc>) -> bool {
        self.cleanup(now);
        match self.seen.get(key) {
            Some(ts) => now.signed_duration_since(*ts) < self.window,
            None => false,
        }
    }

    pub fn mark_as_processed(&mut self, key: &str, now: DateTime<Utc>) {
        self.seen.insert(key.to_string(), now);
    }

    /// Evict expired entries, at most once per window.
    fn cleanup(&mut self, now: DateTime<Utc>) {
        match self.last_cleanup {
            Some(last) if now.signed_duration_since(last) < self.window => return,
            None => {
                self.last_cleanup = Some(now);
                return;
            }
            _ => {}
        }

        let window = self.window;
        let before = self.seen.len();
        self.seen
            .retain(|_, ts| now.signed_duration_since(*ts) < window);
        self.last_cleanup = Some(now);

        let evicted = before - self.seen.len();
        if evicted > 0 {
            tracing::debug!(target: "ingest", evicted, remaining = self.seen.len(), "dedup cleanup");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 6, 9, 0, 0).unwrap()
    }

    #[test]
    fn check_does_not_record() {
        let mut f = DuplicateFilter::with_window_hours(48);
        assert!(!f.is_duplicate("k", t0()));
        assert!(!f.is_duplicate("k", t0()));
        assert!(f.is_empty());
    }

    #[test]
    fn marked_key_is_duplicate_inside_window_only() {
        let mut f = DuplicateFilter::with_window_hours(48);
        assert!(!f.is_duplicate("k", t0()));
        f.mark_as_processed("k", t0());
        assert!(f.is_duplicate("k", t0() + ChronoDuration::hours(47)));
        assert!(!f.is_duplicate("k", t0() + ChronoDuration::hours(48)));
    }

    #[test]
    fn cleanup_is_throttled_to_once_per_window() {
        let mut f = DuplicateFilter::with_window_hours(1);
        f.is_duplicate("warmup", t0());
        f.mark_as_processed("a", t0());

        // Expired but not yet evicted: cleanup ran at t0, next allowed at t0 + 1h.
        let t1 = t0() + ChronoDuration::minutes(59);
        f.mark_as_processed("b", t1);
        assert!(!f.is_duplicate("x", t1));
        assert_eq!(f.len(), 2);

        let t2 = t0() + ChronoDuration::minutes(61);
        assert!(!f.is_duplicate("a", t2));
        assert_eq!(f.len(), 1);
        assert!(f.is_duplicate("b", t2));
    }
}
