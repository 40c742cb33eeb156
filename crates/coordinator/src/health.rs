//! Node discovery, liveness and local telemetry loops
//!
//! Three independent background loops keep the registry current. None of
//! them ever stops on a failed iteration; they log and try again on the
//! next tick (discovery backs off to its retry interval).

use crate::executor::{PeerDiscovery, RemoteExecutor, TelemetrySource};
use crate::node::NodeStatus;
use crate::registry::NodeRegistry;
use chrono::Utc;
use futures::future::join_all;
use nodemesh_common::config::CoordinatorConfig;
use nodemesh_common::error::{MeshError, Result};
use nodemesh_common::METRICS;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Loop timings
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub discovery_interval: Duration,
    pub discovery_retry: Duration,
    pub heartbeat_timeout: Duration,
    pub sweep_interval: Duration,
    pub telemetry_interval: Duration,

    /// Actively probe peers before expiring them
    pub probe_peers: bool,
}

impl MonitorSettings {
    pub fn from_config(config: &CoordinatorConfig) -> Self {
        Self {
            discovery_interval: Duration::from_secs(config.discovery_interval_secs),
            discovery_retry: Duration::from_secs(config.discovery_retry_secs),
            heartbeat_timeout: Duration::from_secs(config.heartbeat_timeout_secs),
            sweep_interval: Duration::from_secs(config.sweep_interval_secs),
            telemetry_interval: Duration::from_secs(config.telemetry_interval_secs),
            probe_peers: config.probe_peers,
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self::from_config(&CoordinatorConfig::default())
    }
}

pub struct HealthMonitor {
    registry: Arc<NodeRegistry>,
    discovery: Arc<dyn PeerDiscovery>,
    telemetry: Arc<dyn TelemetrySource>,
    remote: Arc<dyn RemoteExecutor>,
    settings: MonitorSettings,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<NodeRegistry>,
        discovery: Arc<dyn PeerDiscovery>,
        telemetry: Arc<dyn TelemetrySource>,
        remote: Arc<dyn RemoteExecutor>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            registry,
            discovery,
            telemetry,
            remote,
            settings,
        }
    }

    /// Register peers the registry does not know yet
    ///
    /// Known nodes are left alone, so a stale discovery source cannot keep a
    /// dead node alive. Returns how many nodes were added.
    pub async fn discover_once(&self) -> Result<usize> {
        let peers = self.discovery.discover().await?;

        let mut added = 0;
        for peer in peers {
            if self.registry.contains(&peer.id) {
                continue;
            }
            self.registry.register(peer);
            added += 1;
        }

        if added > 0 {
            info!(added, total = self.registry.len(), "Discovered new nodes");
        }
        Ok(added)
    }

    /// Probe peers if enabled, then take expired peers offline
    ///
    /// Returns the ids of nodes that went offline in this sweep.
    pub async fn sweep_once(&self) -> Vec<String> {
        if self.settings.probe_peers {
            self.probe_peers().await;
        }

        let now = Utc::now();

        let mut expired = Vec::new();
        for handle in self.registry.handles() {
            let mut node = handle.lock();
            if self.registry.is_local(&node.id) || node.status == NodeStatus::Offline {
                continue;
            }
            // A heartbeat in the future (clock skew) never expires.
            let stale = (now - node.last_heartbeat)
                .to_std()
                .map(|silence| silence > self.settings.heartbeat_timeout)
                .unwrap_or(false);
            if stale {
                node.status = NodeStatus::Offline;
                node.expired_by_sweep = true;
                expired.push(node.id.clone());
            }
        }

        for node_id in &expired {
            let reason = MeshError::NodeTimeout(format!(
                "no heartbeat for more than {:?}",
                self.settings.heartbeat_timeout
            ));
            warn!(node_id = %node_id, error = %reason, "Marking node offline");
        }
        if !expired.is_empty() {
            METRICS.coordinator.nodes_expired.inc_by(expired.len() as u64);
        }
        self.registry.refresh_gauges();

        expired
    }

    /// Health-check every peer concurrently; a serving peer counts as a heartbeat
    async fn probe_peers(&self) {
        let targets: Vec<(String, String)> = self
            .registry
            .list_all()
            .into_iter()
            .filter(|node| !self.registry.is_local(&node.id))
            .map(|node| (node.id, node.address))
            .collect();

        let probes = targets.into_iter().map(|(node_id, address)| async move {
            let outcome = self.remote.health_check(&address).await;
            (node_id, outcome)
        });

        for (node_id, outcome) in join_all(probes).await {
            match outcome {
                Ok(true) => self.mark_alive(&node_id),
                Ok(false) => debug!(node_id = %node_id, "Node reports not serving"),
                Err(e) => debug!(node_id = %node_id, error = %e, "Health probe failed"),
            }
        }
    }

    fn mark_alive(&self, node_id: &str) {
        // The node may have been unregistered while the probe was running.
        let Some(handle) = self.registry.handle(node_id) else {
            return;
        };

        // Statuses set through the registry are left for the operator to undo.
        let mut node = handle.lock();
        node.touch();
        if node.expired_by_sweep {
            node.status = NodeStatus::Online;
            node.expired_by_sweep = false;
            info!(node_id = %node_id, "Node is reachable again");
        }
    }

    /// Copy the host's resource usage onto the local node
    pub async fn refresh_local_telemetry(&self) -> Result<()> {
        let resources = self.telemetry.snapshot().await?;
        self.registry
            .update_resources(self.registry.local_node_id(), &resources)
    }

    /// Spawn the discovery, sweep and telemetry loops
    pub fn start(self: Arc<Self>) -> MonitorHandles {
        info!(
            discovery_interval = ?self.settings.discovery_interval,
            sweep_interval = ?self.settings.sweep_interval,
            heartbeat_timeout = ?self.settings.heartbeat_timeout,
            "Starting health monitor"
        );

        let monitor = self.clone();
        let discovery = tokio::spawn(async move {
            loop {
                let wait = match monitor.discover_once().await {
                    Ok(_) => monitor.settings.discovery_interval,
                    Err(e) => {
                        warn!(error = %e, "Node discovery failed");
                        monitor.settings.discovery_retry
                    }
                };
                tokio::time::sleep(wait).await;
            }
        });

        let monitor = self.clone();
        let sweep = tokio::spawn(async move {
            let mut interval = tokio::time::interval(monitor.settings.sweep_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                monitor.sweep_once().await;
            }
        });

        let monitor = self;
        let telemetry = tokio::spawn(async move {
            let mut interval = tokio::time::interval(monitor.settings.telemetry_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                if let Err(e) = monitor.refresh_local_telemetry().await {
                    warn!(error = %e, "Failed to refresh local telemetry");
                }
            }
        });

        MonitorHandles {
            discovery,
            sweep,
            telemetry,
        }
    }
}

/// Running monitor loops; each can be aborted on its own
pub struct MonitorHandles {
    pub discovery: JoinHandle<()>,
    pub sweep: JoinHandle<()>,
    pub telemetry: JoinHandle<()>,
}

impl MonitorHandles {
    /// Stop every loop and wait for them to wind down
    pub async fn shutdown(self) {
        for handle in [self.discovery, self.sweep, self.telemetry] {
            handle.abort();
            let _ = handle.await;
        }
        info!("Health monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{descriptor, MockDiscovery, MockExecutor, MockTelemetry};
    use chrono::Duration as ChronoDuration;

    struct Fixture {
        registry: Arc<NodeRegistry>,
        discovery: Arc<MockDiscovery>,
        remote: Arc<MockExecutor>,
        monitor: Arc<HealthMonitor>,
    }

    fn fixture(peers: Vec<crate::node::NodeDescriptor>, probe_peers: bool) -> Fixture {
        let registry = Arc::new(NodeRegistry::new(descriptor("local")));
        let discovery = Arc::new(MockDiscovery::with_peers(peers));
        let remote = Arc::new(MockExecutor::new());
        let settings = MonitorSettings {
            probe_peers,
            ..MonitorSettings::default()
        };
        let monitor = Arc::new(HealthMonitor::new(
            registry.clone(),
            discovery.clone(),
            Arc::new(MockTelemetry::new(42.0, 0)),
            remote.clone(),
            settings,
        ));

        Fixture {
            registry,
            discovery,
            remote,
            monitor,
        }
    }

    fn age(registry: &NodeRegistry, node_id: &str, seconds: i64) {
        registry.handle(node_id).unwrap().lock().last_heartbeat = Utc::now() - ChronoDuration::seconds(seconds);
    }

    #[tokio::test]
    async fn test_stale_node_goes_offline() {
        let f = fixture(vec![], false);
        f.registry.register(descriptor("peer-1"));
        f.registry.register(descriptor("peer-2"));
        age(&f.registry, "peer-1", 300);
        age(&f.registry, "local", 300);

        let expired = f.monitor.sweep_once().await;

        assert_eq!(expired, vec!["peer-1".to_string()]);
        let online: Vec<_> = f.registry.list_online().into_iter().map(|n| n.id).collect();
        assert_eq!(online, vec!["local".to_string(), "peer-2".to_string()]);

        // Already offline nodes are not expired again.
        assert!(f.monitor.sweep_once().await.is_empty());
        assert!(f.registry.get("peer-1").is_some());
    }

    #[tokio::test]
    async fn test_reregister_restores_online() {
        let f = fixture(vec![], false);
        f.registry.register(descriptor("peer-1"));
        age(&f.registry, "peer-1", 300);
        f.monitor.sweep_once().await;
        assert_eq!(f.registry.get("peer-1").unwrap().status, NodeStatus::Offline);

        f.registry.register(descriptor("peer-1"));

        assert_eq!(f.registry.get("peer-1").unwrap().status, NodeStatus::Online);
        assert!(f.monitor.sweep_once().await.is_empty());
    }

    #[tokio::test]
    async fn test_health_check_keeps_reachable_peers_alive() {
        let f = fixture(vec![], true);
        f.registry.register(descriptor("alive"));
        f.registry.register(descriptor("dead"));
        f.remote.set_unreachable("http://dead:50051");
        age(&f.registry, "alive", 300);
        age(&f.registry, "dead", 300);

        let expired = f.monitor.sweep_once().await;

        assert_eq!(expired, vec!["dead".to_string()]);
        assert_eq!(f.remote.health_check_count(), 2);
        assert_eq!(f.registry.get("alive").unwrap().status, NodeStatus::Online);
    }

    #[tokio::test]
    async fn test_not_serving_peer_still_expires() {
        let f = fixture(vec![], true);
        f.remote.set_serving(false);
        f.registry.register(descriptor("draining"));
        age(&f.registry, "draining", 300);

        assert_eq!(f.monitor.sweep_once().await, vec!["draining".to_string()]);
    }

    #[tokio::test]
    async fn test_health_check_restores_expired_peer() {
        let f = fixture(vec![], true);
        f.registry.register(descriptor("peer-1"));
        f.remote.set_unreachable("http://peer-1:50051");
        age(&f.registry, "peer-1", 300);
        assert_eq!(f.monitor.sweep_once().await, vec!["peer-1".to_string()]);

        // Reachable again: the next sweep brings it back.
        f.remote.set_reachable("http://peer-1:50051");
        f.monitor.sweep_once().await;

        let node = f.registry.get("peer-1").unwrap();
        assert_eq!(node.status, NodeStatus::Online);
        assert!(!node.expired_by_sweep);
    }

    #[tokio::test]
    async fn test_health_check_keeps_operator_status() {
        let f = fixture(vec![], true);
        f.registry.register(descriptor("maint"));
        f.registry.register(descriptor("broken"));
        f.registry.update_status("maint", NodeStatus::Offline).unwrap();
        f.registry.update_status("broken", NodeStatus::Error).unwrap();
        age(&f.registry, "broken", 300);

        f.monitor.sweep_once().await;

        assert_eq!(f.registry.get("maint").unwrap().status, NodeStatus::Offline);
        let broken = f.registry.get("broken").unwrap();
        assert_eq!(broken.status, NodeStatus::Error);
        // The probe still counts as a heartbeat.
        assert!(Utc::now() - broken.last_heartbeat < ChronoDuration::seconds(5));
    }

    #[tokio::test]
    async fn test_status_update_clears_sweep_expiry() {
        let f = fixture(vec![], true);
        f.registry.register(descriptor("peer-1"));
        f.remote.set_unreachable("http://peer-1:50051");
        age(&f.registry, "peer-1", 300);
        f.monitor.sweep_once().await;

        f.registry.update_status("peer-1", NodeStatus::Offline).unwrap();
        f.remote.set_reachable("http://peer-1:50051");
        f.monitor.sweep_once().await;

        assert_eq!(f.registry.get("peer-1").unwrap().status, NodeStatus::Offline);
    }

    #[tokio::test]
    async fn test_discovery_only_inserts_unknown_nodes() {
        let f = fixture(vec![descriptor("peer-1"), descriptor("peer-2")], false);
        f.registry.register(descriptor("peer-1"));
        f.registry.update_status("peer-1", NodeStatus::Busy).unwrap();
        age(&f.registry, "peer-1", 300);

        let added = f.monitor.discover_once().await.unwrap();

        assert_eq!(added, 1);
        assert_eq!(f.registry.len(), 3);
        let known = f.registry.get("peer-1").unwrap();
        assert_eq!(known.status, NodeStatus::Busy);
        assert!(Utc::now() - known.last_heartbeat > ChronoDuration::seconds(200));
    }

    #[tokio::test]
    async fn test_discovery_failure_is_reported() {
        let f = fixture(vec![], false);
        f.discovery.set_failing(true);

        assert!(f.monitor.discover_once().await.is_err());
        assert_eq!(f.registry.len(), 1);
    }

    #[tokio::test]
    async fn test_local_telemetry_refresh() {
        let f = fixture(vec![], false);
        age(&f.registry, "local", 60);

        f.monitor.refresh_local_telemetry().await.unwrap();

        let local = f.registry.get("local").unwrap();
        assert_eq!(local.resources.cpu_percent, Some(42.0));
        assert!(Utc::now() - local.last_heartbeat < ChronoDuration::seconds(5));
    }

    #[tokio::test]
    async fn test_loops_start_and_stop() {
        let f = fixture(vec![descriptor("peer-1")], false);

        let handles = f.monitor.clone().start();
        // Discovery runs immediately on start.
        for _ in 0..50 {
            if f.discovery.calls() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(f.discovery.calls() >= 1);
        assert!(f.registry.contains("peer-1"));

        handles.shutdown().await;
    }
}
