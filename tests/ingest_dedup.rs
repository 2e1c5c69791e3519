// tests/ingest_dedup.rs
use amazon_link_monitor::ingest::dedup::DuplicateFilter;
use amazon_link_monitor::ingest::normalize::normalize_url;
use chrono::{Duration, TimeZone, Utc};

#[test]
fn same_key_twice_in_window_then_again_after_window() {
    let mut f = DuplicateFilter::with_window_hours(24);
    let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
    let key = normalize_url("https://amazon.in/dp/B0ABCDEFGH?tag=x");

    // first sighting: new, then recorded after the (simulated) successful dispatch
    assert!(!f.is_duplicate(&key, t0));
    f.mark_as_processed(&key, t0);

    // second sighting inside the window
    assert!(f.is_duplicate(&key, t0 + Duration::hours(3)));

    // window elapsed: new again
    assert!(!f.is_duplicate(&key, t0 + Duration::hours(24) + Duration::seconds(1)));
}

#[test]
fn remarking_extends_the_window() {
    let mut f = DuplicateFilter::with_window_hours(1);
    let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
    f.mark_as_processed("k", t0);
    f.mark_as_processed("k", t0 + Duration::minutes(50));
    assert!(f.is_duplicate("k", t0 + Duration::minutes(90)));
}

#[test]
fn non_positive_window_is_clamped() {
    let f = DuplicateFilter::with_window_hours(0);
    assert_eq!(f.window(), Duration::seconds(1));
}
