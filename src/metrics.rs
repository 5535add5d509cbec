//! Prometheus counters for the collector loops, plus the text exposition
//! endpoint served alongside them.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus::{Encoder, GaugeVec, IntCounterVec, Opts, Registry, TextEncoder};
use tokio::sync::broadcast;
use tracing::info;

use crate::error::Result;

pub const OUTCOME_SUCCESS: &str = "success";
pub const OUTCOME_ERROR: &str = "error";

pub struct Metrics {
    registry: Registry,
    /// Quota/usage scrapes by (service_type, outcome).
    pub scrapes: IntCounterVec,
    /// Rate scrapes by (service_type, outcome).
    pub rate_scrapes: IntCounterVec,
    /// Capacity scrapes by (capacitor_id, outcome).
    pub capacity_scrapes: IntCounterVec,
    /// Quota pushes by (service_type, outcome).
    pub quota_syncs: IntCounterVec,
    /// Discovery cycles by outcome.
    pub discovery_runs: IntCounterVec,
    /// Outbox submissions by outcome.
    pub mail_submissions: IntCounterVec,
    /// Numeric observations recovered from driver metrics blobs, by
    /// (service_type, sample name).
    pub plugin_samples: GaugeVec,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let scrapes = IntCounterVec::new(
            Opts::new("limes_scrapes_total", "Completed quota/usage scrapes."),
            &["service_type", "outcome"],
        )?;
        let rate_scrapes = IntCounterVec::new(
            Opts::new("limes_rate_scrapes_total", "Completed rate scrapes."),
            &["service_type", "outcome"],
        )?;
        let capacity_scrapes = IntCounterVec::new(
            Opts::new("limes_capacity_scrapes_total", "Completed capacity scrapes."),
            &["capacitor_id", "outcome"],
        )?;
        let quota_syncs = IntCounterVec::new(
            Opts::new("limes_quota_syncs_total", "Quota pushes to backends."),
            &["service_type", "outcome"],
        )?;
        let discovery_runs = IntCounterVec::new(
            Opts::new("limes_discovery_runs_total", "Domain/project discovery cycles."),
            &["outcome"],
        )?;
        let mail_submissions = IntCounterVec::new(
            Opts::new("limes_mail_submissions_total", "Mail outbox submissions."),
            &["outcome"],
        )?;
        let plugin_samples = GaugeVec::new(
            Opts::new(
                "limes_plugin_metrics",
                "Numeric observations reported by quota drivers.",
            ),
            &["service_type", "name"],
        )?;

        registry.register(Box::new(scrapes.clone()))?;
        registry.register(Box::new(rate_scrapes.clone()))?;
        registry.register(Box::new(capacity_scrapes.clone()))?;
        registry.register(Box::new(quota_syncs.clone()))?;
        registry.register(Box::new(discovery_runs.clone()))?;
        registry.register(Box::new(mail_submissions.clone()))?;
        registry.register(Box::new(plugin_samples.clone()))?;

        Ok(Arc::new(Self {
            registry,
            scrapes,
            rate_scrapes,
            capacity_scrapes,
            quota_syncs,
            discovery_runs,
            mail_submissions,
            plugin_samples,
        }))
    }

    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    match metrics.render() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to render metrics: {e:#}"),
        ),
    }
}

/// Serve `/metrics` until the shutdown signal fires.
pub async fn serve(
    listen_address: &str,
    metrics: Arc<Metrics>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let router = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);

    let listener = tokio::net::TcpListener::bind(listen_address).await?;
    info!(address = listen_address, "metrics listener started");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await?;
    Ok(())
}
