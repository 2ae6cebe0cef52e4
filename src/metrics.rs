use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("harvest_polls_total", "Poll cycles started, per source.");
        describe_counter!(
            "harvest_polls_skipped_total",
            "Poll cycles skipped by the rate limiter or a running batch."
        );
        describe_counter!("harvest_new_items_total", "New items captured, per source.");
        describe_counter!("harvest_poll_errors_total", "Failed poll cycles, per source.");
        describe_counter!(
            "harvest_escalations_total",
            "Session reinitializations requested by failing pollers."
        );
        describe_counter!("batch_runs_total", "Batch runs started.");
        describe_counter!(
            "batch_stage_failures_total",
            "Batch stages that exhausted their retries."
        );
        describe_gauge!(
            "harvest_scraping_enabled",
            "1 while live polling is allowed, 0 during a batch."
        );
    });
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder. Call once per process.
    pub fn init() -> Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;
        ensure_metrics_described();
        gauge!("harvest_scraping_enabled").set(1.0);
        Ok(Self { handle })
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
