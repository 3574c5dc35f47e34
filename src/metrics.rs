//! Prometheus metrics.
//!
//! `names`/`labels` constant modules, a `PrometheusBuilder` with per-metric
//! histogram buckets, and a `record_*`/`set_*` function per metric, covering
//! this core's matching/ledger/bus concerns. Crates: `metrics`,
//! `metrics-exporter-prometheus`.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Metric names as constants for consistency.
pub mod names {
    pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";

    pub const ORDERS_SUBMITTED_TOTAL: &str = "orders_submitted_total";
    pub const ORDERS_REJECTED_TOTAL: &str = "orders_rejected_total";
    pub const ORDERS_CANCELLED_TOTAL: &str = "orders_cancelled_total";
    pub const ORDER_MATCH_DURATION_SECONDS: &str = "order_match_duration_seconds";
    pub const TRADES_EXECUTED_TOTAL: &str = "trades_executed_total";
    pub const TRADE_VOLUME_QUOTE: &str = "trade_volume_quote";

    pub const SETTLEMENTS_TOTAL: &str = "settlements_total";
    pub const SYMBOL_HALTED_TOTAL: &str = "symbol_halted_total";

    pub const WAL_APPEND_DURATION_SECONDS: &str = "wal_append_duration_seconds";
    pub const WAL_REPLAY_EVENTS_TOTAL: &str = "wal_replay_events_total";

    pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
    pub const WS_MESSAGES_SENT_TOTAL: &str = "ws_messages_sent_total";
    pub const WS_SUBSCRIPTIONS_LAGGED_TOTAL: &str = "ws_subscriptions_lagged_total";
}

/// Label keys.
pub mod labels {
    pub const METHOD: &str = "method";
    pub const ENDPOINT: &str = "endpoint";
    pub const STATUS: &str = "status";
    pub const SYMBOL: &str = "symbol";
    pub const SIDE: &str = "side";
    pub const ORDER_TYPE: &str = "order_type";
    pub const ERROR_CODE: &str = "error_code";
    pub const CHANNEL: &str = "channel";
}

/// Install the Prometheus recorder and configure bucket boundaries for the
/// latency histograms this core emits. Returns a handle whose `render()`
/// backs the `/metrics` route.
pub fn init_metrics() -> PrometheusHandle {
    let builder = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(names::HTTP_REQUEST_DURATION_SECONDS.to_string()),
            &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
        )
        .expect("valid bucket spec")
        .set_buckets_for_metric(
            Matcher::Full(names::ORDER_MATCH_DURATION_SECONDS.to_string()),
            &[0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1],
        )
        .expect("valid bucket spec")
        .set_buckets_for_metric(
            Matcher::Full(names::WAL_APPEND_DURATION_SECONDS.to_string()),
            &[0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01],
        )
        .expect("valid bucket spec");

    builder.install_recorder().expect("failed to install Prometheus recorder")
}

pub fn record_http_request(method: &str, endpoint: &str, status: u16, duration_secs: f64) {
    let status = status.to_string();
    counter!(
        names::HTTP_REQUESTS_TOTAL,
        labels::METHOD => method.to_string(),
        labels::ENDPOINT => endpoint.to_string(),
        labels::STATUS => status.clone()
    )
    .increment(1);
    histogram!(
        names::HTTP_REQUEST_DURATION_SECONDS,
        labels::METHOD => method.to_string(),
        labels::ENDPOINT => endpoint.to_string(),
        labels::STATUS => status
    )
    .record(duration_secs);
}

pub fn record_order_submitted(symbol: &str, side: &str, order_type: &str) {
    counter!(
        names::ORDERS_SUBMITTED_TOTAL,
        labels::SYMBOL => symbol.to_string(),
        labels::SIDE => side.to_string(),
        labels::ORDER_TYPE => order_type.to_string()
    )
    .increment(1);
}

pub fn record_order_rejected(symbol: &str, error_code: &'static str) {
    counter!(
        names::ORDERS_REJECTED_TOTAL,
        labels::SYMBOL => symbol.to_string(),
        labels::ERROR_CODE => error_code
    )
    .increment(1);
}

pub fn record_order_cancelled(symbol: &str) {
    counter!(names::ORDERS_CANCELLED_TOTAL, labels::SYMBOL => symbol.to_string()).increment(1);
}

pub fn record_order_match_duration(duration_secs: f64) {
    histogram!(names::ORDER_MATCH_DURATION_SECONDS).record(duration_secs);
}

pub fn record_trade_executed(symbol: &str, notional: f64) {
    counter!(names::TRADES_EXECUTED_TOTAL, labels::SYMBOL => symbol.to_string()).increment(1);
    counter!(names::TRADE_VOLUME_QUOTE, labels::SYMBOL => symbol.to_string()).increment(notional as u64);
}

pub fn record_settlement(symbol: &str) {
    counter!(names::SETTLEMENTS_TOTAL, labels::SYMBOL => symbol.to_string()).increment(1);
}

pub fn record_symbol_halted(symbol: &str) {
    counter!(names::SYMBOL_HALTED_TOTAL, labels::SYMBOL => symbol.to_string()).increment(1);
}

pub fn record_wal_append(duration_secs: f64) {
    histogram!(names::WAL_APPEND_DURATION_SECONDS).record(duration_secs);
}

pub fn record_wal_replay_events(symbol: &str, count: u64) {
    counter!(names::WAL_REPLAY_EVENTS_TOTAL, labels::SYMBOL => symbol.to_string()).increment(count);
}

pub fn set_ws_connections(count: i64) {
    gauge!(names::WS_CONNECTIONS_ACTIVE).set(count as f64);
}

pub fn record_ws_message_sent(channel: &str) {
    counter!(names::WS_MESSAGES_SENT_TOTAL, labels::CHANNEL => channel.to_string()).increment(1);
}

pub fn record_ws_subscription_lagged(channel: &str) {
    counter!(names::WS_SUBSCRIPTIONS_LAGGED_TOTAL, labels::CHANNEL => channel.to_string()).increment(1);
}

/// Timing helper for the handful of call sites that measure a duration
/// around a block rather than pre-computing it.
pub struct Timer(std::time::Instant);

impl Timer {
    pub fn start() -> Self {
        Self(std::time::Instant::now())
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.0.elapsed().as_secs_f64()
    }
}
