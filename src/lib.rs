// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod api;
pub mod config;
pub mod metrics;
pub mod monitor;

// Intake: classification, dedup, progress, processor, live + rescan tasks.
pub mod ingest;

// Outbound processing API.
pub mod notify;

// ---- Re-exports for stable public API ----
pub use crate::api::create_router;
pub use crate::config::MonitorConfig;
pub use crate::ingest::{MessageProcessor, ProcessOutcome, ProcessorSettings};
pub use crate::monitor::Monitor;
pub use crate::notify::{DispatchOutcome, Dispatcher, LinkPayload, TokenBotClient};
