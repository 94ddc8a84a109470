//! Error taxonomy for the monitoring engine.
//!
//! Per-record failures (an unresolvable process, a failed geolocation) never
//! show up here; they degrade into placeholder values inside the pipeline.
//! Only the three failure classes that callers can actually observe get
//! types: a catastrophic sample failure (tick aborted, loop survives), a
//! geolocation provider failure (swallowed into a negative cache entry),
//! and construction-time misconfiguration (fatal).

use thiserror::Error;

/// Catastrophic failure of the OS connection enumeration. Aborts the
/// current tick; the monitor loop stays running and retries next interval.
#[derive(Error, Debug)]
pub enum SampleError {
    #[error("connection enumeration failed: {0}")]
    Enumeration(String),
}

/// Failure of a single external geolocation lookup. Never propagates past
/// the geo cache; it becomes a negative entry with a short TTL.
#[derive(Error, Debug)]
pub enum GeoError {
    #[error("geolocation request failed: {0}")]
    Request(String),

    #[error("geolocation provider returned no result for {0}")]
    NotFound(std::net::IpAddr),
}

/// Invalid configuration detected at construction time, before the monitor
/// can be started.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}
