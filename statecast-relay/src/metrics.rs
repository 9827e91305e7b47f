//! Prometheus metrics for the relay
//!
//! Everything is registered on one registry, rendered by `GET /metrics`.

use prometheus::{
    register_int_counter_with_registry, register_int_gauge_with_registry, Encoder, IntCounter,
    IntGauge, Registry, TextEncoder,
};
use std::sync::LazyLock;

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

macro_rules! counter {
    ($name:ident, $metric:literal, $help:literal) => {
        pub static $name: LazyLock<IntCounter> = LazyLock::new(|| {
            register_int_counter_with_registry!($metric, $help, REGISTRY.clone())
                .expect(concat!("Failed to register ", stringify!($name)))
        });
    };
}

counter!(EVENTS_ENQUEUED, "statecast_events_enqueued_total", "Events accepted into a batch queue");
counter!(EVENTS_DROPPED, "statecast_events_dropped_total", "Events discarded by the scoring hook");
counter!(BATCHES_FLUSHED, "statecast_batches_flushed_total", "Batch queue flushes with at least one event");
counter!(FRAMES_DELIVERED, "statecast_frames_delivered_total", "Batch frames handed to a connection");
counter!(FRAMES_THROTTLED, "statecast_frames_throttled_total", "Batch frames withheld by a connection's token bucket");
counter!(FRAMES_DENIED, "statecast_frames_denied_total", "Batch frames withheld by the authorization hook");
counter!(FRAMES_OVERFLOWED, "statecast_frames_overflowed_total", "Frames dropped because a connection's outbound queue was full");
counter!(BUS_PUBLISHED, "statecast_bus_published_total", "Events published to the bus");
counter!(BUS_PUBLISH_FAILURES, "statecast_bus_publish_failures_total", "Failed bus publish attempts");
counter!(BUS_RECEIVED, "statecast_bus_received_total", "Events received from peer instances");
counter!(CONNECTIONS_REAPED, "statecast_connections_reaped_total", "Connections terminated by the liveness monitor");

pub static ACTIVE_CONNECTIONS: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge_with_registry!(
        "statecast_active_connections",
        "Current number of open relay connections",
        REGISTRY.clone()
    )
    .expect("Failed to register ACTIVE_CONNECTIONS")
});

/// Render all metrics in the Prometheus text exposition format
pub fn gather() -> anyhow::Result<String> {
    // Lazily registered metrics only show up once touched
    for counter in [
        &EVENTS_ENQUEUED,
        &EVENTS_DROPPED,
        &BATCHES_FLUSHED,
        &FRAMES_DELIVERED,
        &FRAMES_THROTTLED,
        &FRAMES_DENIED,
        &FRAMES_OVERFLOWED,
        &BUS_PUBLISHED,
        &BUS_PUBLISH_FAILURES,
        &BUS_RECEIVED,
        &CONNECTIONS_REAPED,
    ] {
        LazyLock::force(counter);
    }
    LazyLock::force(&ACTIVE_CONNECTIONS);

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
