//! Group Reply Relay — Binary Entrypoint
//! Loads configuration, wires the relay to the HTTP collaborators, serves
//! the status API and shuts down cleanly on Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use group_reply_relay::api::{self, AppState};
use group_reply_relay::config::AppConfig;
use group_reply_relay::listener::ListenerOptions;
use group_reply_relay::metrics::Metrics;
use group_reply_relay::notify::{run_alert_loop, NotifierMux};
use group_reply_relay::platform::extractor::HttpLinkExtractor;
use group_reply_relay::platform::http::HttpSessionFactory;
use group_reply_relay::reply::build_generator;
use group_reply_relay::ReplySystem;

/// `LOG_FORMAT=json` switches to JSON lines; `RUST_LOG` overrides the filter.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("group_reply_relay=info,warn"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "ctrl-c handler failed");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = AppConfig::load_default().context("loading relay configuration")?;
    tracing::info!(
        sources = cfg.sources.len(),
        workers = cfg.workers.len(),
        data_dir = %cfg.data_dir.display(),
        "configuration loaded"
    );

    let metrics = Metrics::init()?;

    let sessions = HttpSessionFactory::new(&cfg.platform.base_url, cfg.platform.timeout_secs)?;
    let extractor = HttpLinkExtractor::new(sessions.client(), &cfg.platform.extractor_url);
    let generator = build_generator(&cfg.generator)?;
    tracing::info!(provider = generator.provider_name(), "reply generator ready");

    tokio::fs::create_dir_all(&cfg.data_dir)
        .await
        .with_context(|| format!("creating data dir {}", cfg.data_dir.display()))?;

    let system = Arc::new(ReplySystem::new(
        Arc::new(extractor),
        Arc::new(sessions),
        generator,
        cfg.dispatch.clone(),
        ListenerOptions {
            dedup: cfg.dedup,
            data_dir: Some(cfg.data_dir.clone()),
        },
    ));

    let mux = NotifierMux::from_env();
    if mux.is_empty() {
        tracing::info!("no alert webhooks configured");
    }
    let alerts = tokio::spawn(run_alert_loop(system.subscribe(), mux, cfg.notify.cooldown_secs));

    let report = system
        .start(cfg.sources.clone(), cfg.workers.clone())
        .await
        .context("starting relay")?;
    for f in &report.sources.failed {
        tracing::warn!(source_id = %f.source_id, error = %f.error, "source not started");
    }

    let app = api::router(AppState::new(system.clone()).with_metrics(metrics.handle.clone()));
    let listener = tokio::net::TcpListener::bind(&cfg.api.bind)
        .await
        .with_context(|| format!("binding {}", cfg.api.bind))?;
    tracing::info!(bind = %cfg.api.bind, "status api listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving status api")?;

    tracing::info!("shutting down");
    system.stop().await;
    alerts.abort();
    Ok(())
}
