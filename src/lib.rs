//! netwatch: passive monitoring of a host's live TCP/UDP connections,
//! enriched with geolocation and scored for risk.
//!
//! The engine polls the OS connection table on a fixed cadence, resolves
//! remote addresses through a rate-limited, TTL-cached geolocation
//! provider, scores every connection against configurable threat rules,
//! and publishes one immutable [`monitor::Snapshot`] per tick for
//! presentation layers and exporters to consume. The OS primitives
//! (connection enumeration, pid-to-name mapping) and the geolocation HTTP
//! endpoint are collaborators behind traits; everything else lives here.

pub mod classifier;
pub mod config;
pub mod errors;
pub mod geo;
pub mod logging;
pub mod monitor;
pub mod sampler;
pub mod stats;

pub use classifier::{ThreatAssessment, ThreatClassifier, ThreatLevel};
pub use config::Config;
pub use errors::{ConfigError, GeoError, SampleError};
pub use geo::{GeoCache, GeoData, GeoInfo, GeoProvider, IpApiProvider};
pub use monitor::{MonitorEvent, NetworkMonitor, Snapshot, SnapshotRecord};
pub use sampler::{
    ConnState, ConnectionRecord, ConnectionSampler, ConnectionSource, ProcessNameResolver,
    Protocol, RawConnection,
};
pub use stats::{SnapshotSummary, StatsView};
