use std::sync::Once;

use metrics::{Unit, describe_counter};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "ateneo_cache_hit_total",
            Unit::Count,
            "Total number of snapshot cache hits."
        );
        describe_counter!(
            "ateneo_cache_miss_total",
            Unit::Count,
            "Total number of snapshot cache misses."
        );
        describe_counter!(
            "ateneo_cache_negative_hit_total",
            Unit::Count,
            "Total number of confirmed-empty sentinel hits."
        );
        describe_counter!(
            "ateneo_cache_error_total",
            Unit::Count,
            "Total number of cache backend errors degraded to misses."
        );
        describe_counter!(
            "ateneo_cache_invalidation_total",
            Unit::Count,
            "Total number of scheduled two-phase cache invalidations."
        );
        describe_counter!(
            "ateneo_flight_joined_total",
            Unit::Count,
            "Total number of callers that joined an in-flight refresh."
        );
        describe_counter!(
            "ateneo_refresh_stale_served_total",
            Unit::Count,
            "Total number of reads answered from persisted rows while a refresh ran in the background."
        );
        describe_counter!(
            "ateneo_refresh_fallback_total",
            Unit::Count,
            "Total number of failed refreshes answered from the last persisted snapshot."
        );
        describe_counter!(
            "ateneo_delay_forwarded_total",
            Unit::Count,
            "Total number of delayed messages forwarded to the ready topic."
        );
        describe_counter!(
            "ateneo_delay_dropped_total",
            Unit::Count,
            "Total number of overdue delayed messages dropped unforwarded."
        );
        describe_counter!(
            "ateneo_session_evicted_total",
            Unit::Count,
            "Total number of pooled portal sessions evicted by the sweeper."
        );
    });
}
