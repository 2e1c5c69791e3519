//! Amazon link monitor binary entrypoint.
//! Starts the intake pipeline in the background and serves the status routes.

use amazon_link_monitor::api::{self, AppState};
use amazon_link_monitor::metrics::Metrics;
use amazon_link_monitor::{Monitor, MonitorConfig};
use shuttle_axum::ShuttleAxum;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// `LOG_FORMAT=json` for JSON lines, compact text otherwise.
/// No-op when the runtime already installed a subscriber.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("amazon_link_monitor=info,warn"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let res = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .try_init()
    };
    if res.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = MonitorConfig::load()?;
    let metrics = match Metrics::init(cfg.dedup_window_hours) {
        Ok(m) => Some(m),
        Err(e) => {
            tracing::warn!(error = ?e, "metrics disabled");
            None
        }
    };

    let monitor = Monitor::from_config(cfg).await?;
    let processor = monitor.processor.clone();

    if processor.dispatcher().health_check().await {
        tracing::info!("processing API healthy");
    } else {
        tracing::warn!("processing API health check failed; links will be retried per message");
    }

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            monitor.shutdown().await;
        }
    });

    let mut router = api::create_router(AppState { processor });
    if let Some(m) = &metrics {
        router = router.merge(m.router());
    }

    Ok(router.into())
}
