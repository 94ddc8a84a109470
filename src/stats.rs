//! Statistics aggregation over a tick's records.
//!
//! Counters are recomputed in full from the current sample every tick, so
//! there is no incremental drift to accumulate; the only carried state is
//! the bounded history of per-tick summaries (FIFO ring buffer) and the
//! cumulative tick counter.

use crate::classifier::ThreatLevel;
use crate::monitor::SnapshotRecord;
use crate::sampler::{ConnState, Protocol};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;

/// Compact record of one tick, kept in the history ring buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub timestamp: DateTime<Local>,
    pub total_connections: u64,
    pub established_count: u64,
    pub unique_remote_ips: u64,
    pub high_threat_count: u64,
}

/// Aggregated view of one tick, plus the bounded history of past ticks.
/// Absent histogram keys mean zero.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StatsView {
    pub total_connections: u64,
    pub tcp_count: u64,
    pub udp_count: u64,
    pub established_count: u64,
    /// Cardinality of the distinct non-local remote addresses in this tick.
    pub unique_remote_ips: u64,
    /// country_code -> count, for non-local records with positive geo only.
    pub country_histogram: HashMap<String, u64>,
    pub threat_histogram: HashMap<ThreatLevel, u64>,
    /// Ticks folded since construction (or the last clear).
    pub ticks_completed: u64,
    /// Oldest first; bounded by the configured capacity.
    pub history: Vec<SnapshotSummary>,
}

pub struct StatsAggregator {
    capacity: usize,
    history: VecDeque<SnapshotSummary>,
    ticks_completed: u64,
}

impl StatsAggregator {
    pub fn new(capacity: usize) -> Self {
        StatsAggregator {
            capacity,
            history: VecDeque::with_capacity(capacity),
            ticks_completed: 0,
        }
    }

    /// Fold one tick's records into a fresh view and append its summary to
    /// the history, evicting the oldest entry once capacity is exceeded.
    pub fn fold(&mut self, timestamp: DateTime<Local>, records: &[SnapshotRecord]) -> StatsView {
        let mut view = StatsView {
            total_connections: records.len() as u64,
            ..StatsView::default()
        };

        let mut remotes: HashSet<IpAddr> = HashSet::new();
        for rec in records {
            match rec.conn.protocol {
                Protocol::Tcp => view.tcp_count += 1,
                Protocol::Udp => view.udp_count += 1,
            }
            if rec.conn.state == ConnState::Established {
                view.established_count += 1;
            }
            if !rec.conn.is_local {
                remotes.insert(rec.conn.remote_addr);
                if let Some(geo) = &rec.geo {
                    if !geo.is_negative && !geo.country_code.is_empty() {
                        *view
                            .country_histogram
                            .entry(geo.country_code.clone())
                            .or_insert(0) += 1;
                    }
                }
            }
            *view.threat_histogram.entry(rec.threat.level).or_insert(0) += 1;
        }
        view.unique_remote_ips = remotes.len() as u64;

        self.ticks_completed += 1;
        view.ticks_completed = self.ticks_completed;

        let summary = SnapshotSummary {
            timestamp,
            total_connections: view.total_connections,
            established_count: view.established_count,
            unique_remote_ips: view.unique_remote_ips,
            high_threat_count: view
                .threat_histogram
                .get(&ThreatLevel::High)
                .copied()
                .unwrap_or(0),
        };
        self.history.push_back(summary);
        while self.history.len() > self.capacity {
            self.history.pop_front();
        }
        view.history = self.history.iter().cloned().collect();

        view
    }

    /// Drop the history and cumulative counters. Does not touch any loop
    /// state; the next tick starts a fresh series.
    pub fn clear(&mut self) {
        self.history.clear();
        self.ticks_completed = 0;
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ThreatAssessment;
    use crate::geo::GeoInfo;
    use crate::sampler::ConnectionRecord;

    fn rec(
        remote: &str,
        protocol: Protocol,
        state: ConnState,
        country: Option<&str>,
        level: ThreatLevel,
    ) -> SnapshotRecord {
        let remote_addr: IpAddr = remote.parse().unwrap();
        let is_local = crate::sampler::is_local_addr(&remote_addr);
        let geo = if is_local {
            Some(GeoInfo::local())
        } else {
            country.map(|c| GeoInfo {
                country_code: c.to_string(),
                country_name: String::new(),
                city: String::new(),
                isp: String::new(),
                resolved_at: Local::now(),
                is_negative: false,
            })
        };
        SnapshotRecord {
            conn: ConnectionRecord {
                local_addr: "192.168.1.5".parse().unwrap(),
                local_port: 50000,
                remote_addr,
                remote_port: 443,
                protocol,
                state,
                pid: None,
                process_name: None,
                is_local,
            },
            geo,
            threat: ThreatAssessment {
                level,
                reasons: Vec::new(),
            },
        }
    }

    #[test]
    fn single_local_established_tcp() {
        let mut agg = StatsAggregator::new(10);
        let records = vec![rec(
            "192.168.1.20",
            Protocol::Tcp,
            ConnState::Established,
            None,
            ThreatLevel::None,
        )];
        let view = agg.fold(Local::now(), &records);
        assert_eq!(view.total_connections, 1);
        assert_eq!(view.tcp_count, 1);
        assert_eq!(view.udp_count, 0);
        assert_eq!(view.established_count, 1);
        assert_eq!(view.unique_remote_ips, 0);
        assert!(view.country_histogram.is_empty());
        assert_eq!(view.threat_histogram.get(&ThreatLevel::None), Some(&1));
    }

    #[test]
    fn unique_remotes_count_distinct_public_addresses() {
        let mut agg = StatsAggregator::new(10);
        let records = vec![
            rec("8.8.8.8", Protocol::Tcp, ConnState::Established, Some("US"), ThreatLevel::None),
            rec("8.8.8.8", Protocol::Udp, ConnState::Unknown, Some("US"), ThreatLevel::None),
            rec("1.1.1.1", Protocol::Tcp, ConnState::TimeWait, Some("AU"), ThreatLevel::None),
            rec("10.0.0.7", Protocol::Tcp, ConnState::Established, None, ThreatLevel::None),
        ];
        let view = agg.fold(Local::now(), &records);
        assert_eq!(view.total_connections, 4);
        assert_eq!(view.tcp_count, 3);
        assert_eq!(view.udp_count, 1);
        assert_eq!(view.unique_remote_ips, 2);
        assert_eq!(view.country_histogram.get("US"), Some(&2));
        assert_eq!(view.country_histogram.get("AU"), Some(&1));
        // Local records contribute to no country, LOCAL included.
        assert!(!view.country_histogram.contains_key("LOCAL"));
    }

    #[test]
    fn negative_geo_contributes_no_country() {
        let mut agg = StatsAggregator::new(10);
        let mut record = rec("8.8.8.8", Protocol::Tcp, ConnState::Established, Some("US"), ThreatLevel::None);
        record.geo.as_mut().unwrap().is_negative = true;
        let view = agg.fold(Local::now(), &[record]);
        assert!(view.country_histogram.is_empty());
        assert_eq!(view.unique_remote_ips, 1);
    }

    #[test]
    fn history_is_a_bounded_ring_buffer() {
        let mut agg = StatsAggregator::new(3);
        for i in 0..5u64 {
            let records: Vec<SnapshotRecord> = (0..=i)
                .map(|_| {
                    rec("8.8.8.8", Protocol::Tcp, ConnState::Established, Some("US"), ThreatLevel::None)
                })
                .collect();
            let view = agg.fold(Local::now(), &records);
            assert!(view.history.len() <= 3);
        }
        assert_eq!(agg.history_len(), 3);
        // Oldest entries (totals 1 and 2) were evicted, oldest-first.
        let totals: Vec<u64> = agg.history.iter().map(|s| s.total_connections).collect();
        assert_eq!(totals, vec![3, 4, 5]);
    }

    #[test]
    fn counters_are_recomputed_not_accumulated() {
        let mut agg = StatsAggregator::new(10);
        let records = vec![rec(
            "8.8.8.8",
            Protocol::Tcp,
            ConnState::Established,
            Some("US"),
            ThreatLevel::High,
        )];
        let first = agg.fold(Local::now(), &records);
        let second = agg.fold(Local::now(), &records);
        assert_eq!(first.total_connections, second.total_connections);
        assert_eq!(first.country_histogram, second.country_histogram);
        assert_eq!(first.threat_histogram, second.threat_histogram);
        assert_eq!(second.ticks_completed, 2);
        assert_eq!(second.history.len(), 2);
    }

    #[test]
    fn clear_resets_history_and_counters() {
        let mut agg = StatsAggregator::new(10);
        let records = vec![rec(
            "8.8.8.8",
            Protocol::Tcp,
            ConnState::Established,
            Some("US"),
            ThreatLevel::None,
        )];
        agg.fold(Local::now(), &records);
        agg.fold(Local::now(), &records);
        agg.clear();
        assert_eq!(agg.history_len(), 0);
        let view = agg.fold(Local::now(), &records);
        assert_eq!(view.ticks_completed, 1);
        assert_eq!(view.history.len(), 1);
    }

    #[test]
    fn high_threat_count_lands_in_the_summary() {
        let mut agg = StatsAggregator::new(10);
        let records = vec![
            rec("8.8.8.8", Protocol::Tcp, ConnState::Established, Some("US"), ThreatLevel::High),
            rec("1.1.1.1", Protocol::Tcp, ConnState::Established, Some("AU"), ThreatLevel::Low),
        ];
        let view = agg.fold(Local::now(), &records);
        assert_eq!(view.history.last().unwrap().high_threat_count, 1);
    }
}
