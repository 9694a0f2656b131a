use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntGauge, Opts, TextEncoder};

fn register_gauge(name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::with_opts(Opts::new(name, help))
        .unwrap_or_else(|e| panic!("failed to create {name}: {e}"));
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .unwrap_or_else(|e| panic!("failed to register {name}: {e}"));
    gauge
}

fn register_counter(name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::with_opts(Opts::new(name, help))
        .unwrap_or_else(|e| panic!("failed to create {name}: {e}"));
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .unwrap_or_else(|e| panic!("failed to register {name}: {e}"));
    counter
}

pub static ACTIVE_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_gauge(
        "session_chat_active_connections",
        "WebSocket connections registered in this process",
    )
});

pub static ACTIVE_SESSIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_gauge(
        "session_chat_active_sessions",
        "Sessions with at least one local connection (one relay subscription each)",
    )
});

pub static MESSAGES_RECEIVED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_counter(
        "session_chat_messages_received_total",
        "Messages accepted, encrypted and persisted",
    )
});

pub static RELAY_DELIVERIES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_counter(
        "session_chat_relay_deliveries_total",
        "Envelopes delivered by the relay reader to local connections",
    )
});

pub static RELAY_MALFORMED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_counter(
        "session_chat_relay_malformed_total",
        "Relay payloads skipped because they could not be decoded",
    )
});

pub static CACHE_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_counter(
        "session_chat_cache_failures_total",
        "Failed message cache writes or reads",
    )
});

pub static INTEGRITY_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_counter(
        "session_chat_integrity_failures_total",
        "Payloads that failed authentication or padding checks",
    )
});

pub async fn metrics_handler() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}
