//! Threat scoring for connection records.
//!
//! Pure, total rule evaluation: every (record, geo) pair maps to a defined
//! assessment. Rules accumulate: each one that fires contributes a reason
//! code, and the final level is the highest severity triggered, so a
//! connection on a malicious port from a suspicious process reports both.
//! Rule tables come from configuration, never from constants baked into
//! the logic.

use crate::config::ThreatConfig;
use crate::geo::GeoInfo;
use crate::sampler::{ConnState, ConnectionRecord};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum ThreatLevel {
    #[default]
    None,
    Low,
    Medium,
    High,
}

impl ThreatLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatLevel::None => "NONE",
            ThreatLevel::Low => "LOW",
            ThreatLevel::Medium => "MEDIUM",
            ThreatLevel::High => "HIGH",
        }
    }
}

/// Reason codes, in rule evaluation order.
pub const REASON_MALICIOUS_PORT: &str = "malicious-port";
pub const REASON_SUSPICIOUS_PORT: &str = "suspicious-port";
pub const REASON_HIGH_RISK_COUNTRY: &str = "high-risk-country";
pub const REASON_SUSPICIOUS_PROCESS: &str = "suspicious-process";
pub const REASON_UNRESOLVED_PROCESS: &str = "unresolved-process";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ThreatAssessment {
    pub level: ThreatLevel,
    /// Every rule that fired, in evaluation order, for explainability.
    pub reasons: Vec<String>,
}

pub struct ThreatClassifier {
    suspicious_ports: HashSet<u16>,
    malicious_ports: HashSet<u16>,
    high_risk_countries: HashSet<String>,
    // Lowercased once at construction; matching is substring,
    // case-insensitive.
    process_patterns: Vec<String>,
}

impl ThreatClassifier {
    pub fn new(config: &ThreatConfig) -> Self {
        let classifier = ThreatClassifier {
            suspicious_ports: config.suspicious_ports.clone(),
            malicious_ports: config.malicious_ports.clone(),
            high_risk_countries: config
                .high_risk_countries
                .iter()
                .map(|c| c.to_uppercase())
                .collect(),
            process_patterns: config
                .suspicious_process_patterns
                .iter()
                .map(|p| p.to_lowercase())
                .collect(),
        };
        info!(
            "threat classifier loaded: {} suspicious ports, {} malicious ports, {} countries, {} process patterns",
            classifier.suspicious_ports.len(),
            classifier.malicious_ports.len(),
            classifier.high_risk_countries.len(),
            classifier.process_patterns.len()
        );
        classifier
    }

    /// Score one connection. Local traffic triggers no rules: ports on
    /// loopback or the LAN are not evidence of anything.
    pub fn classify(&self, conn: &ConnectionRecord, geo: Option<&GeoInfo>) -> ThreatAssessment {
        let mut level = ThreatLevel::None;
        let mut reasons = Vec::new();

        if conn.is_local {
            return ThreatAssessment { level, reasons };
        }

        // Port rule: malicious takes precedence over merely suspicious.
        if self.malicious_ports.contains(&conn.remote_port)
            || self.malicious_ports.contains(&conn.local_port)
        {
            level = level.max(ThreatLevel::High);
            reasons.push(REASON_MALICIOUS_PORT.to_string());
        } else if self.suspicious_ports.contains(&conn.remote_port)
            || self.suspicious_ports.contains(&conn.local_port)
        {
            level = level.max(ThreatLevel::Low);
            reasons.push(REASON_SUSPICIOUS_PORT.to_string());
        }

        // Country rule: only positive geolocation counts; a negative entry
        // has no country to judge.
        if let Some(geo) = geo {
            if !geo.is_negative && self.high_risk_countries.contains(&geo.country_code.to_uppercase())
            {
                level = level.max(ThreatLevel::Medium);
                reasons.push(REASON_HIGH_RISK_COUNTRY.to_string());
            }
        }

        // Process rule.
        if let Some(name) = &conn.process_name {
            let name_lower = name.to_lowercase();
            if self.process_patterns.iter().any(|p| name_lower.contains(p)) {
                level = level.max(ThreatLevel::Medium);
                reasons.push(REASON_SUSPICIOUS_PROCESS.to_string());
            }
        } else if conn.state == ConnState::Established {
            // A live connection to the outside world that no process will
            // answer for.
            level = level.max(ThreatLevel::Low);
            reasons.push(REASON_UNRESOLVED_PROCESS.to_string());
        }

        ThreatAssessment { level, reasons }
    }
}
