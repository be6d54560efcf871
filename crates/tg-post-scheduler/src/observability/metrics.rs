use super::GLOBAL_LABELS;
use std::net::SocketAddr;

/// Histogram buckets to measure the distribution of durations in seconds
pub(crate) const DEFAULT_DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

const DEFAULT_LISTEN_ADDR: ([u8; 4], u16) = ([0, 0, 0, 0], 2000);

/// Starts the prometheus scrape endpoint. The address may be overridden
/// with `METRICS_LISTEN_ADDR`.
pub fn init_metrics() {
    let listen_addr = std::env::var("METRICS_LISTEN_ADDR")
        .ok()
        .map(|addr| {
            addr.parse::<SocketAddr>()
                .unwrap_or_else(|err| panic!("BUG: invalid METRICS_LISTEN_ADDR `{addr}`: {err}"))
        })
        .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.into());

    let mut builder = metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(listen_addr)
        .set_buckets(DEFAULT_DURATION_BUCKETS)
        .expect("BUG: the default buckets must not be empty");

    for (key, value) in GLOBAL_LABELS {
        builder = builder.add_global_label(*key, *value);
    }

    builder
        .install()
        .expect("BUG: failed to initialize the metrics listener");

    describe_metrics();
}

fn describe_metrics() {
    metrics::describe_histogram!(
        "http_request_duration_seconds",
        metrics::Unit::Seconds,
        "Duration of a single real http request. Retries appear as separate observations."
    );
    metrics::describe_histogram!(
        "http_request_effective_duration_seconds",
        metrics::Unit::Seconds,
        "Same as `http_request_duration_seconds`, but includes the time spent on retries."
    );
    metrics::describe_counter!(
        "tg_updates_total",
        "Number of updates received from Telegram"
    );
    metrics::describe_counter!(
        "tg_updates_skipped_total",
        "Number of updates received from Telegram, that were skipped by the bot"
    );
    metrics::describe_counter!(
        "posts_published_total",
        "Number of scheduled posts delivered to their channels"
    );
    metrics::describe_counter!(
        "posts_failed_total",
        "Number of scheduled posts that were given up on"
    );
    metrics::describe_counter!(
        "posts_released_total",
        "Number of scheduled posts put back into the queue after a transient failure"
    );
    metrics::describe_histogram!(
        "publisher_tick_duration_seconds",
        metrics::Unit::Seconds,
        "Duration of a single pass of the publisher over the due posts"
    );
    metrics::describe_counter!(
        "payment_webhooks_total",
        "Number of payment provider webhooks by provider and outcome"
    );
    metrics::describe_counter!(
        "premium_activations_total",
        "Number of premium access activations by source"
    );
}
