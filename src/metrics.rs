// src/metrics.rs
use axum::{routing::get, Router};
use metrics::describe_counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder and pre-describe the pipeline series
    /// so they show up on /metrics from the first scrape.
    pub fn init() -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| anyhow::anyhow!("prometheus recorder: {e}"))?;

        describe_series();

        Ok(Self { handle })
    }

    /// Router exposing `/metrics` in Prometheus exposition format.
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

/// One-time registration so series show up on /metrics before first use.
fn describe_series() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("auth_failures_total", "Rejected credential presentations by class.");
        describe_counter!("replay_rejected_total", "Tokens rejected by jti replay suppression.");
        describe_counter!("jwks_refresh_total", "JWKS cache refreshes.");
        describe_counter!("poll_cycles_total", "Completed poll cycles across all subscriptions.");
        describe_counter!("items_ingested_total", "New items registered after dedup and moderation.");
        describe_counter!("items_blocked_total", "Items dropped by the moderation gate.");
        describe_counter!("feed_entries_parsed_total", "Entries parsed out of fetched feeds.");
        describe_counter!("feed_not_modified_total", "Conditional fetches answered with 304.");
        describe_counter!("moderation_decisions_total", "Moderation classifications performed.");
        describe_counter!("moderation_blocked_total", "Moderation classifications that blocked.");
        describe_counter!("insights_extracted_total", "Insights persisted by the extractor.");
        describe_counter!("insight_fallback_total", "Items that fell back to the neutral insight.");
        describe_counter!("digests_sent_total", "Digest deliveries that succeeded.");
        describe_counter!("digest_failures_total", "Digest deliveries that exhausted retries.");
    });
}
