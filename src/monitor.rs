//! The monitor loop: owns the polling cadence, drives the
//! sample → resolve → classify → aggregate pipeline, and publishes one
//! immutable [`Snapshot`] per tick to any number of subscribers.
//!
//! Consumers never block on a tick in progress: snapshots are published
//! over a broadcast channel and the latest one is always available through
//! [`NetworkMonitor::current_snapshot`]. Stopping is cooperative: the
//! in-flight tick finishes and publishes before the loop is considered
//! stopped.

use crate::classifier::{ThreatAssessment, ThreatClassifier};
use crate::config::Config;
use crate::errors::{ConfigError, SampleError};
use crate::geo::{GeoCache, GeoInfo, GeoProvider};
use crate::sampler::{ConnectionRecord, ConnectionSampler, ConnectionSource, ProcessNameResolver};
use crate::stats::{StatsAggregator, StatsView};
use chrono::{DateTime, Local};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// One fully-resolved connection within a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub conn: ConnectionRecord,
    pub geo: Option<GeoInfo>,
    pub threat: ThreatAssessment,
}

/// The unit of publication: everything the engine knows at one tick.
/// Immutable after construction; shared with consumers via `Arc`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: DateTime<Local>,
    /// In the order the OS enumerated them this tick.
    pub records: Vec<SnapshotRecord>,
    pub stats: StatsView,
}

/// What subscribers receive: a snapshot per successful tick, or a distinct
/// error event when the sample stage failed catastrophically. A tick error
/// never stops the loop.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    Snapshot(Arc<Snapshot>),
    TickError {
        message: String,
        timestamp: DateTime<Local>,
    },
}

/// The monitoring engine. Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct NetworkMonitor {
    sampler: Arc<ConnectionSampler>,
    geo: Arc<GeoCache>,
    classifier: Arc<ThreatClassifier>,
    stats: Arc<Mutex<StatsAggregator>>,
    events: broadcast::Sender<MonitorEvent>,
    current: Arc<RwLock<Option<Arc<Snapshot>>>>,
    // Serializes ticks (periodic and manual), so snapshots publish in tick
    // order with strictly increasing timestamps.
    tick_lock: Arc<Mutex<()>>,
    loop_handle: Arc<Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>>,
    poll_interval: Duration,
}

impl NetworkMonitor {
    /// Build the engine from validated configuration and the three OS/network
    /// collaborators. Fails fast on misconfiguration, the only fatal error
    /// in the engine's lifetime.
    pub fn new(
        config: &Config,
        source: Arc<dyn ConnectionSource>,
        resolver: Arc<dyn ProcessNameResolver>,
        geo_provider: Arc<dyn GeoProvider>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(NetworkMonitor {
            sampler: Arc::new(ConnectionSampler::new(source, resolver)),
            geo: Arc::new(GeoCache::new(&config.geo, geo_provider)),
            classifier: Arc::new(ThreatClassifier::new(&config.threat)),
            stats: Arc::new(Mutex::new(StatsAggregator::new(
                config.monitoring.history_capacity,
            ))),
            events,
            current: Arc::new(RwLock::new(None)),
            tick_lock: Arc::new(Mutex::new(())),
            loop_handle: Arc::new(Mutex::new(None)),
            poll_interval: Duration::from_secs(config.monitoring.poll_interval_seconds),
        })
    }

    /// Begin periodic ticking. No-op if already running.
    pub async fn start(&self) {
        let mut guard = self.loop_handle.lock().await;
        if guard.is_some() {
            debug!("monitor already running");
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let monitor = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(monitor.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    // Shutdown wins over an elapsed timer, so a stop that
                    // arrived during the previous tick is honored before
                    // another tick starts.
                    biased;
                    _ = shutdown_rx.changed() => {
                        info!("monitor loop shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        // Awaited here, so a shutdown signal arriving
                        // mid-tick waits for the tick to publish.
                        monitor.run_tick().await;
                    }
                }
            }
        });

        *guard = Some((shutdown_tx, handle));
        info!(
            "monitor started (poll interval {}s)",
            self.poll_interval.as_secs()
        );
    }

    /// Stop periodic ticking. Waits for the in-flight tick, if any, to
    /// complete and publish. No-op if not running.
    pub async fn stop(&self) {
        let taken = self.loop_handle.lock().await.take();
        if let Some((shutdown_tx, handle)) = taken {
            let _ = shutdown_tx.send(true);
            if let Err(e) = handle.await {
                warn!("monitor loop task failed during shutdown: {}", e);
            }
            info!("monitor stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.loop_handle.lock().await.is_some()
    }

    /// Run the full pipeline once, regardless of loop state, and publish the
    /// result exactly like a periodic tick. Does not transition the state
    /// machine.
    pub async fn refresh_once(&self) -> Result<Arc<Snapshot>, SampleError> {
        let _tick = self.tick_lock.lock().await;

        let sampler = self.sampler.clone();
        let sampled = tokio::task::spawn_blocking(move || sampler.sample())
            .await
            .map_err(|e| SampleError::Enumeration(format!("sampling task failed: {e}")))??;

        let snapshot = Arc::new(self.build_snapshot(sampled).await);
        *self.current.write().await = Some(snapshot.clone());
        // Send fails only when nobody is subscribed; that is fine.
        let _ = self.events.send(MonitorEvent::Snapshot(snapshot.clone()));
        debug!(
            "published snapshot: {} connections, {} unique remotes",
            snapshot.stats.total_connections, snapshot.stats.unique_remote_ips
        );
        Ok(snapshot)
    }

    /// Subscribe to published events. Dropping the receiver unsubscribes;
    /// subscribing again starts a fresh sequence from the next tick.
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    /// The last published snapshot, for late subscribers.
    pub async fn current_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.current.read().await.clone()
    }

    /// Reset accumulated statistics (history, cumulative counters) and the
    /// geolocation cache. Running state is unaffected.
    pub async fn clear(&self) {
        self.stats.lock().await.clear();
        self.geo.clear().await;
        info!("statistics and geo cache cleared");
    }

    async fn run_tick(&self) {
        if let Err(e) = self.refresh_once().await {
            warn!("tick aborted: {}", e);
            let _ = self.events.send(MonitorEvent::TickError {
                message: e.to_string(),
                timestamp: Local::now(),
            });
        }
    }

    /// Resolve, classify, and aggregate one tick's records. Resolutions for
    /// distinct addresses run concurrently; all are awaited before the
    /// snapshot is constructed.
    async fn build_snapshot(&self, records: Vec<ConnectionRecord>) -> Snapshot {
        // One resolution per distinct remote address, not per record.
        let mut pending: HashMap<IpAddr, bool> = HashMap::new();
        for rec in &records {
            pending.entry(rec.remote_addr).or_insert(rec.is_local);
        }

        let mut tasks = JoinSet::new();
        for (addr, is_local) in pending {
            let geo = self.geo.clone();
            tasks.spawn(async move { (addr, geo.resolve(addr, is_local).await) });
        }

        let mut resolved: HashMap<IpAddr, GeoInfo> = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((addr, info)) => {
                    resolved.insert(addr, info);
                }
                Err(e) => warn!("geo resolution task failed: {}", e),
            }
        }

        let snapshot_records: Vec<SnapshotRecord> = records
            .into_iter()
            .map(|conn| {
                let geo = resolved.get(&conn.remote_addr).cloned();
                let threat = self.classifier.classify(&conn, geo.as_ref());
                SnapshotRecord { conn, geo, threat }
            })
            .collect();

        let timestamp = Local::now();
        let stats = self.stats.lock().await.fold(timestamp, &snapshot_records);
        Snapshot {
            timestamp,
            records: snapshot_records,
            stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{ThreatLevel, REASON_MALICIOUS_PORT};
    use crate::errors::GeoError;
    use crate::geo::GeoData;
    use crate::sampler::RawConnection;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::{Notify, Semaphore};

    struct StaticSource(Vec<RawConnection>);

    impl ConnectionSource for StaticSource {
        fn list_connections(&self) -> Result<Vec<RawConnection>, SampleError> {
            Ok(self.0.clone())
        }
    }

    struct FailingSource;

    impl ConnectionSource for FailingSource {
        fn list_connections(&self) -> Result<Vec<RawConnection>, SampleError> {
            Err(SampleError::Enumeration("permission denied".to_string()))
        }
    }

    struct NoResolver;

    impl ProcessNameResolver for NoResolver {
        fn process_name(&self, _pid: u32) -> Option<String> {
            None
        }
    }

    struct StaticProvider {
        calls: AtomicUsize,
    }

    impl StaticProvider {
        fn new() -> Self {
            StaticProvider {
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl GeoProvider for StaticProvider {
        async fn lookup(&self, _addr: IpAddr) -> Result<GeoData, GeoError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(GeoData {
                country_code: "US".to_string(),
                country_name: "United States".to_string(),
                city: "Dallas".to_string(),
                isp: "Example ISP".to_string(),
            })
        }
    }

    /// Provider that parks inside `lookup` until the test releases it, so a
    /// tick can be held deliberately in flight.
    struct GatedProvider {
        entered: Arc<Notify>,
        release: Arc<Semaphore>,
    }

    #[async_trait]
    impl GeoProvider for GatedProvider {
        async fn lookup(&self, _addr: IpAddr) -> Result<GeoData, GeoError> {
            self.entered.notify_one();
            let _permit = self.release.acquire().await.expect("semaphore closed");
            Ok(GeoData {
                country_code: "US".to_string(),
                country_name: "United States".to_string(),
                city: "Dallas".to_string(),
                isp: "Example ISP".to_string(),
            })
        }
    }

    fn raw(local: &str, lport: u16, remote: &str, rport: u16) -> RawConnection {
        RawConnection {
            protocol: "tcp".to_string(),
            state: "ESTABLISHED".to_string(),
            local_addr: local.parse().unwrap(),
            local_port: lport,
            remote_addr: Some(remote.parse().unwrap()),
            remote_port: rport,
            pid: None,
        }
    }

    fn monitor_with(
        source: Arc<dyn ConnectionSource>,
        provider: Arc<dyn GeoProvider>,
    ) -> NetworkMonitor {
        let mut config = Config::default();
        config.monitoring.poll_interval_seconds = 1;
        config.geo.lookup_timeout_ms = 60_000;
        NetworkMonitor::new(&config, source, Arc::new(NoResolver), provider).unwrap()
    }

    #[test]
    fn invalid_config_is_rejected_at_construction() {
        let mut config = Config::default();
        config.monitoring.poll_interval_seconds = 0;
        let result = NetworkMonitor::new(
            &config,
            Arc::new(StaticSource(Vec::new())),
            Arc::new(NoResolver),
            Arc::new(StaticProvider::new()),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn refresh_once_publishes_and_updates_current() {
        let monitor = monitor_with(
            Arc::new(StaticSource(vec![raw("192.168.1.5", 50000, "8.8.8.8", 443)])),
            Arc::new(StaticProvider::new()),
        );
        let mut rx = monitor.subscribe();
        assert!(monitor.current_snapshot().await.is_none());

        let snapshot = monitor.refresh_once().await.unwrap();
        assert_eq!(snapshot.records.len(), 1);
        assert_eq!(snapshot.records[0].geo.as_ref().unwrap().country_code, "US");

        let current = monitor.current_snapshot().await.unwrap();
        assert_eq!(current.timestamp, snapshot.timestamp);

        match rx.recv().await.unwrap() {
            MonitorEvent::Snapshot(published) => {
                assert_eq!(published.timestamp, snapshot.timestamp)
            }
            other => panic!("expected a snapshot event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn refresh_once_is_idempotent_on_a_stable_source() {
        let monitor = monitor_with(
            Arc::new(StaticSource(vec![
                raw("192.168.1.5", 50000, "8.8.8.8", 443),
                raw("192.168.1.5", 50001, "192.168.1.20", 445),
            ])),
            Arc::new(StaticProvider::new()),
        );
        let first = monitor.refresh_once().await.unwrap();
        let second = monitor.refresh_once().await.unwrap();

        let keys = |s: &Snapshot| s.records.iter().map(|r| r.conn.key()).collect::<Vec<_>>();
        assert_eq!(keys(&first), keys(&second));
        assert_eq!(first.stats.total_connections, second.stats.total_connections);
        assert_eq!(first.stats.tcp_count, second.stats.tcp_count);
        assert_eq!(first.stats.established_count, second.stats.established_count);
        assert_eq!(first.stats.unique_remote_ips, second.stats.unique_remote_ips);
        assert_eq!(first.stats.country_histogram, second.stats.country_histogram);
        // Only history length and the tick counter may differ.
        assert_eq!(first.stats.history.len(), 1);
        assert_eq!(second.stats.history.len(), 2);
        assert!(first.timestamp < second.timestamp);
    }

    #[tokio::test]
    async fn local_records_get_synthetic_geo_without_provider_calls() {
        let provider = Arc::new(StaticProvider::new());
        let monitor = monitor_with(
            Arc::new(StaticSource(vec![
                raw("192.168.1.5", 50000, "192.168.1.20", 445),
                raw("127.0.0.1", 8080, "127.0.0.1", 50002),
            ])),
            provider.clone(),
        );
        let snapshot = monitor.refresh_once().await.unwrap();
        for rec in &snapshot.records {
            assert_eq!(rec.geo.as_ref().unwrap().country_code, "LOCAL");
            assert_eq!(rec.threat.level, ThreatLevel::None);
        }
        assert_eq!(provider.calls.load(Ordering::Relaxed), 0);
        assert_eq!(snapshot.stats.unique_remote_ips, 0);
        assert!(snapshot.stats.country_histogram.is_empty());
    }

    #[tokio::test]
    async fn malicious_port_scenario_scores_high_with_port_reason() {
        let monitor = monitor_with(
            Arc::new(StaticSource(vec![raw("192.168.1.5", 50000, "203.0.113.9", 4444)])),
            Arc::new(StaticProvider::new()),
        );
        let snapshot = monitor.refresh_once().await.unwrap();
        let rec = &snapshot.records[0];
        assert!(rec.threat.level >= ThreatLevel::Low);
        assert!(rec.threat.reasons.iter().any(|r| r == REASON_MALICIOUS_PORT));
        assert_eq!(snapshot.stats.unique_remote_ips, 1);
    }

    #[tokio::test]
    async fn records_preserve_enumeration_order() {
        let entries = vec![
            raw("192.168.1.5", 50000, "8.8.8.8", 443),
            raw("192.168.1.5", 50001, "1.1.1.1", 443),
            raw("192.168.1.5", 50002, "192.168.1.20", 22),
        ];
        let monitor = monitor_with(
            Arc::new(StaticSource(entries.clone())),
            Arc::new(StaticProvider::new()),
        );
        let snapshot = monitor.refresh_once().await.unwrap();
        let remotes: Vec<IpAddr> = snapshot
            .records
            .iter()
            .map(|r| r.conn.remote_addr)
            .collect();
        let expected: Vec<IpAddr> = entries
            .iter()
            .map(|e| e.remote_addr.unwrap())
            .collect();
        assert_eq!(remotes, expected);
    }

    #[tokio::test]
    async fn clear_resets_stats_and_geo_but_not_run_state() {
        let provider = Arc::new(StaticProvider::new());
        let monitor = monitor_with(
            Arc::new(StaticSource(vec![raw("192.168.1.5", 50000, "8.8.8.8", 443)])),
            provider.clone(),
        );
        monitor.refresh_once().await.unwrap();
        monitor.refresh_once().await.unwrap();
        monitor.clear().await;
        let snapshot = monitor.refresh_once().await.unwrap();
        assert_eq!(snapshot.stats.ticks_completed, 1);
        assert_eq!(snapshot.stats.history.len(), 1);
        // Geo cache was cleared too, so the provider was consulted again.
        assert_eq!(provider.calls.load(Ordering::Relaxed), 2);
    }

    // The loop tests below rely on the first interval tick firing
    // immediately on start, so none of them wait out a poll interval.
    #[tokio::test]
    async fn sample_failure_reports_tick_error_and_loop_survives() {
        let monitor = monitor_with(Arc::new(FailingSource), Arc::new(StaticProvider::new()));
        let mut rx = monitor.subscribe();

        monitor.start().await;
        match rx.recv().await.unwrap() {
            MonitorEvent::TickError { message, .. } => {
                assert!(message.contains("permission denied"))
            }
            other => panic!("expected a tick error, got {:?}", other),
        }
        assert!(monitor.is_running().await);
        monitor.stop().await;
        assert!(!monitor.is_running().await);
    }

    #[tokio::test]
    async fn start_twice_is_a_no_op_and_stop_is_graceful() {
        let monitor = monitor_with(
            Arc::new(StaticSource(vec![raw("192.168.1.5", 50000, "192.168.1.20", 22)])),
            Arc::new(StaticProvider::new()),
        );
        monitor.start().await;
        monitor.start().await;
        assert!(monitor.is_running().await);
        monitor.stop().await;
        monitor.stop().await;
        assert!(!monitor.is_running().await);
    }

    #[tokio::test]
    async fn stop_mid_tick_lets_the_in_flight_snapshot_publish() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Semaphore::new(0));
        let provider = Arc::new(GatedProvider {
            entered: entered.clone(),
            release: release.clone(),
        });
        let monitor = monitor_with(
            Arc::new(StaticSource(vec![raw("192.168.1.5", 50000, "8.8.8.8", 443)])),
            provider,
        );
        let mut rx = monitor.subscribe();

        monitor.start().await;
        // Wait until the first tick is provably in flight (provider entered).
        entered.notified().await;

        // Stop while the tick is parked inside the provider.
        let stopper = {
            let monitor = monitor.clone();
            tokio::spawn(async move { monitor.stop().await })
        };

        // Let the lookup finish; the tick must complete and publish.
        release.add_permits(1);
        stopper.await.unwrap();

        match rx.recv().await.unwrap() {
            MonitorEvent::Snapshot(snapshot) => {
                assert_eq!(snapshot.records.len(), 1);
            }
            other => panic!("expected the in-flight snapshot, got {:?}", other),
        }
        // The loop is stopped: nothing further arrives.
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
        assert!(!monitor.is_running().await);
    }
}
