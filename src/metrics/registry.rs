use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`, `gauge!`,
/// `histogram!`) can be used anywhere in the codebase. The `PrometheusHandle`
/// is retained solely for rendering the `/metrics` endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric descriptions.
    ///
    /// Must be called **once** at startup before any `counter!` / `gauge!` /
    /// `histogram!` calls.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        describe_counter!(
            "hubproxy_requests_total",
            Unit::Count,
            "Total requests processed, by route class and status"
        );
        describe_histogram!(
            "hubproxy_request_duration_seconds",
            Unit::Seconds,
            "Request duration from client perspective"
        );
        describe_histogram!(
            "hubproxy_upstream_request_duration_seconds",
            Unit::Seconds,
            "Upstream request duration"
        );
        describe_gauge!(
            "hubproxy_connections_active",
            Unit::Count,
            "Number of active downstream connections"
        );
        describe_counter!(
            "hubproxy_connections_total",
            Unit::Count,
            "Total connections accepted"
        );

        describe_counter!(
            "hubproxy_rate_limit_rejected_total",
            Unit::Count,
            "Total requests rejected by the rate limiter"
        );
        describe_counter!(
            "hubproxy_rate_limit_allowed_total",
            Unit::Count,
            "Total requests allowed by the rate limiter"
        );
        describe_gauge!(
            "hubproxy_rate_limit_buckets",
            Unit::Count,
            "Number of live token-bucket entries"
        );

        describe_counter!(
            "hubproxy_token_cache_hits_total",
            Unit::Count,
            "Registry auth token cache hits"
        );
        describe_counter!(
            "hubproxy_token_cache_misses_total",
            Unit::Count,
            "Registry auth token cache misses"
        );

        describe_counter!(
            "hubproxy_config_reloads_total",
            Unit::Count,
            "Config reload attempts, by outcome"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
