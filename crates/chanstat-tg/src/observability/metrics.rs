use super::GLOBAL_LABELS;
use crate::config::from_env_or_panic;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use serde::Deserialize;

/// Histogram buckets to measure the distribution of request durations in seconds
pub(crate) const DEFAULT_DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Buckets for whole report job runs, these take much longer than a single request
pub(crate) const JOB_DURATION_BUCKETS: &[f64] = &[
    0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0,
];

#[derive(Deserialize)]
struct MetricsConfig {
    /// The prometheus listener isn't started if the port is not set
    metrics_port: Option<u16>,
}

pub fn init_metrics() {
    let config: MetricsConfig = from_env_or_panic("");

    let Some(port) = config.metrics_port else {
        return;
    };

    let mut builder = PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .set_buckets_for_metric(
            Matcher::Full("http_request_duration_seconds".to_owned()),
            DEFAULT_DURATION_BUCKETS,
        )
        .and_then(|builder| {
            builder.set_buckets_for_metric(
                Matcher::Full("http_request_effective_duration_seconds".to_owned()),
                DEFAULT_DURATION_BUCKETS,
            )
        })
        .and_then(|builder| {
            builder.set_buckets_for_metric(
                Matcher::Full("report_job_duration_seconds".to_owned()),
                JOB_DURATION_BUCKETS,
            )
        })
        .unwrap_or_else(|err| panic!("BUG: invalid histogram buckets: {err:#?}"));

    for (key, value) in GLOBAL_LABELS {
        builder = builder.add_global_label(*key, *value);
    }

    builder
        .install()
        .unwrap_or_else(|err| panic!("BUG: failed to initialize the metrics listener: {err:#?}"));
}
