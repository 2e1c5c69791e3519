pub mod monitor;

pub use monitor::{MonitorConfig, DEFAULT_MONITOR_CONFIG_PATH, ENV_MONITOR_CONFIG_PATH};
