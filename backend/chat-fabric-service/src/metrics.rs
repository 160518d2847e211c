use actix_web::{http::header::ContentType, HttpResponse};
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder};

fn register<C>(collector: C, name: &str) -> C
where
    C: prometheus::core::Collector + Clone + 'static,
{
    prometheus::default_registry()
        .register(Box::new(collector.clone()))
        .unwrap_or_else(|e| panic!("failed to register {name}: {e}"));
    collector
}

pub static FANOUT_PUBLISHED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "fanout_published_total",
            "Events published to the fanout broker",
        ),
        &["event"],
    )
    .expect("failed to create fanout_published_total");
    register(counter, "fanout_published_total")
});

pub static FANOUT_DELIVERED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "fanout_delivered_total",
        "Frames written to local websocket sessions",
    )
    .expect("failed to create fanout_delivered_total");
    register(counter, "fanout_delivered_total")
});

pub static PRESENCE_ONLINE_IDENTITIES: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "presence_online_identities",
        "Identities with at least one live session, as last observed",
    )
    .expect("failed to create presence_online_identities");
    register(gauge, "presence_online_identities")
});

pub static PRESENCE_REAPED_SESSIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "presence_reaped_sessions_total",
        "Sessions removed because their owning instance stopped heartbeating",
    )
    .expect("failed to create presence_reaped_sessions_total");
    register(counter, "presence_reaped_sessions_total")
});

pub static EXPIRY_SWEEP_DELETED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "expiry_sweep_deleted_total",
        "Messages hard-deleted by the expiry sweep",
    )
    .expect("failed to create expiry_sweep_deleted_total");
    register(counter, "expiry_sweep_deleted_total")
});

pub static ENVELOPE_KEY_ROTATIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "envelope_key_rotations_total",
        "Envelope ring rotations performed by this instance",
    )
    .expect("failed to create envelope_key_rotations_total");
    register(counter, "envelope_key_rotations_total")
});

pub static ENVELOPE_DECRYPT_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "envelope_decrypt_failures_total",
        "Payloads no ring key could open",
    )
    .expect("failed to create envelope_decrypt_failures_total");
    register(counter, "envelope_decrypt_failures_total")
});

pub async fn metrics_handler() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(ContentType::plaintext())
        .body(buffer)
}
