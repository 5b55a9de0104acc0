//! alertpipe -- security alert processing pipeline.
//!
//! This crate drives alerts through ML detection, LLM triage, knowledge-base
//! enrichment, case creation, and response decisions, behind a
//! sliding-window rate limiter and a resilient service-client layer.

pub mod api;
pub mod client;
pub mod config;
pub mod events;
pub mod fallback;
pub mod pipeline;
pub mod ratelimit;
pub mod redact;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use crate::api::state::AppState;
use crate::config::{AppConfig, LoggingConfig};
use crate::events::{EventBus, ALERT_PROCESSED};
use crate::pipeline::AlertPipeline;
use crate::ratelimit::RateLimitPolicy;
use crate::redact::{RedactingWriter, Redactor};

/// Install the global subscriber. `RUST_LOG` takes precedence over the
/// configured level. Logs go to stderr with secrets redacted.
pub fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let redactor = Arc::new(Redactor::new().context("failed to compile redaction patterns")?);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(RedactingWriter::new(std::io::stderr, redactor));
    // A second init (e.g. in tests) is harmless.
    let _ = if logging.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    Ok(())
}

/// Build a pipeline from configuration, logging every completed run.
pub async fn build_pipeline(config: &AppConfig) -> Result<Arc<AlertPipeline>> {
    let events = Arc::new(EventBus::new());
    events
        .subscribe_fn(ALERT_PROCESSED, |event| async move {
            tracing::debug!(
                event_id = %event.id,
                alert_id = %event.payload["alert_id"],
                final_status = %event.payload["final_status"],
                "alert_processed"
            );
            Ok(())
        })
        .await;

    let pipeline = AlertPipeline::from_config(
        &config.services,
        config.retry.policy(),
        config.pipeline.clone(),
        events,
    )
    .context("failed to build service clients")?;
    Ok(Arc::new(pipeline))
}

/// Start the alertpipe daemon: queue worker plus API server.
pub async fn serve(config: AppConfig) -> Result<()> {
    let pipeline = build_pipeline(&config).await?;
    let rate_limits = Arc::new(RateLimitPolicy::from_config(&config.rate_limit));
    let state = AppState::new(pipeline, rate_limits)?.with_admin_token(config.server.admin_token.clone());
    state.manager.start();

    let addr: SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", config.server.bind))?;
    let app = api::router(state.clone());

    tracing::info!(
        %addr,
        rate_limit = config.rate_limit.enabled,
        admin_api = state.admin_token.is_some(),
        "alertpipe listening"
    );
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.manager.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
