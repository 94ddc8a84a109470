use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub monitoring: MonitoringConfig,
    pub threat: ThreatConfig,
    pub geo: GeoConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Tick cadence for the monitor loop, in seconds.
    pub poll_interval_seconds: u64,
    /// How many per-tick summaries the stats history ring buffer keeps.
    pub history_capacity: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ThreatConfig {
    /// Ports that warrant at least a LOW rating when seen on either end of
    /// a non-local connection (proxies, debug bridges, IRC).
    pub suspicious_ports: HashSet<u16>,
    /// Ports associated with known malware/C2 tooling; always HIGH.
    pub malicious_ports: HashSet<u16>,
    /// ISO country codes rated at least MEDIUM.
    pub high_risk_countries: HashSet<String>,
    /// Case-insensitive substrings matched against the owning process name.
    pub suspicious_process_patterns: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GeoConfig {
    /// TTL for successful lookups. Geography rarely changes.
    pub positive_ttl_seconds: u64,
    /// TTL for failed/ratelimited lookups, so retries are throttled but not
    /// deferred forever.
    pub negative_ttl_seconds: u64,
    /// External lookup budget, in calls per second.
    pub rate_limit_per_second: u32,
    /// Upper bound on a single external lookup before it degrades to a
    /// negative result.
    pub lookup_timeout_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_file: Option<String>,
    pub log_level: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        MonitoringConfig {
            poll_interval_seconds: 2,
            history_capacity: 60,
        }
    }
}

impl Default for ThreatConfig {
    fn default() -> Self {
        // Default rule tables are policy data, not logic: operators are
        // expected to override them. The port sets cover the usual proxy
        // and backdoor suspects (SOCKS, squid, meterpreter, netbus, sub7).
        ThreatConfig {
            suspicious_ports: [1080, 3128, 5555, 6666, 6667, 8080, 8888, 9999]
                .into_iter()
                .collect(),
            malicious_ports: [1337, 4444, 12345, 27374, 31337].into_iter().collect(),
            high_risk_countries: ["KP", "IR", "SY", "CU"]
                .into_iter()
                .map(String::from)
                .collect(),
            suspicious_process_patterns: ["nc", "ncat", "socat", "meterpreter", "mimikatz"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl Default for GeoConfig {
    fn default() -> Self {
        GeoConfig {
            positive_ttl_seconds: 86_400,
            negative_ttl_seconds: 120,
            rate_limit_per_second: 10,
            lookup_timeout_ms: 3_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_file: Some("logs/netwatch.log".to_string()),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let config: Config = serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with. Called before the monitor
    /// is constructed, so a bad file fails fast instead of surfacing as a
    /// zero-length timer or an always-empty history later.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.monitoring.poll_interval_seconds == 0 {
            return Err(ConfigError::Invalid {
                field: "monitoring.poll_interval_seconds",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.monitoring.history_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "monitoring.history_capacity",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.geo.positive_ttl_seconds == 0 {
            return Err(ConfigError::Invalid {
                field: "geo.positive_ttl_seconds",
                reason: "must be nonzero".to_string(),
            });
        }
        if self.geo.negative_ttl_seconds == 0 {
            return Err(ConfigError::Invalid {
                field: "geo.negative_ttl_seconds",
                reason: "must be nonzero".to_string(),
            });
        }
        if self.geo.rate_limit_per_second == 0 {
            return Err(ConfigError::Invalid {
                field: "geo.rate_limit_per_second",
                reason: "must allow at least one call per second".to_string(),
            });
        }
        if self.geo.lookup_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "geo.lookup_timeout_ms",
                reason: "must be nonzero".to_string(),
            });
        }
        Ok(())
    }
}
