//! Keep-alive for connections that would otherwise sit idle long enough for
//! a load balancer or proxy to drop them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use uuid::Uuid;

use crate::config::KeeperConfig;
use crate::connection::ConnectionHandle;
use crate::factory::ConnectionFactory;
use crate::monitor::{TopologyChangeEvent, TopologyMonitor, TopologyObserver, TopologySubscription};
use crate::schedule::Periodic;
use crate::topology::{key_slot, TopologySnapshot};
use crate::{lock, Error};

/// Result of one keep-alive pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshOutcome {
    pub succeeded: usize,
    pub failed: usize,
}

fn track(connections: &Mutex<Vec<ConnectionHandle>>, handle: &ConnectionHandle) -> bool {
    let mut connections = lock(connections);
    if connections.contains(handle) {
        return false;
    }
    connections.push(handle.clone());
    true
}

fn untrack(connections: &Mutex<Vec<ConnectionHandle>>, handle: &ConnectionHandle) -> bool {
    let mut connections = lock(connections);
    let before = connections.len();
    connections.retain(|c| c != handle);
    connections.len() != before
}

/// Pings every tracked standalone connection on a fixed interval.
pub struct ConnectionKeeper {
    connections: Arc<Mutex<Vec<ConnectionHandle>>>,
    periodic: Periodic,
}

impl ConnectionKeeper {
    pub fn new(interval: Duration) -> Self {
        Self {
            connections: Arc::new(Mutex::new(Vec::new())),
            periodic: Periodic::new("connection-keeper", interval),
        }
    }

    pub fn from_config(config: &KeeperConfig) -> Self {
        Self::new(config.refresh_connection_interval)
    }

    /// Track `handle`. Returns false if it was already tracked.
    pub fn add(&self, handle: &ConnectionHandle) -> bool {
        track(&self.connections, handle)
    }

    pub fn remove(&self, handle: &ConnectionHandle) -> bool {
        untrack(&self.connections, handle)
    }

    pub fn tracked(&self) -> usize {
        lock(&self.connections).len()
    }

    pub async fn refresh_once(&self) -> RefreshOutcome {
        refresh_standalone(&self.connections).await
    }

    pub fn start(&self) -> bool {
        let connections = self.connections.clone();
        self.periodic.start(move || {
            let connections = connections.clone();
            async move {
                refresh_standalone(&connections).await;
            }
        })
    }

    pub fn stop(&self) -> bool {
        self.periodic.stop()
    }

    pub fn is_running(&self) -> bool {
        self.periodic.is_running()
    }

    pub async fn shutdown(&self) {
        self.periodic.shutdown().await
    }
}

async fn refresh_standalone(connections: &Mutex<Vec<ConnectionHandle>>) -> RefreshOutcome {
    let connections: Vec<ConnectionHandle> = lock(connections).clone();
    let mut outcome = RefreshOutcome::default();

    for handle in &connections {
        tracing::info!(connection = %handle.name(), "Refresh connection");
        match handle.ping().await {
            Ok(()) => outcome.succeeded += 1,
            Err(e) => {
                outcome.failed += 1;
                tracing::error!(connection = %handle.name(), "Refresh connection failed: {}", e);
            }
        }
    }
    outcome
}

/// Keys chosen so that each one lands on a different master.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshKeySet {
    /// One key per covered master, in slot order of the masters.
    pub keys: Vec<String>,
    pub covered: usize,
    pub nodes: usize,
}

impl RefreshKeySet {
    pub fn is_complete(&self) -> bool {
        self.covered == self.nodes
    }
}

/// Draw candidate keys until every master of `snapshot` has one, or until
/// `max_probes` candidates were tried.
pub fn representative_keys(
    snapshot: &TopologySnapshot,
    max_probes: usize,
    mut candidate: impl FnMut() -> String,
) -> RefreshKeySet {
    let nodes = snapshot.nodes();
    let mut found: HashMap<u16, String> = HashMap::new();

    for _ in 0..max_probes {
        if found.len() == nodes.len() {
            break;
        }
        let key = candidate();
        if let Some(owner) = snapshot.node_for_slot(key_slot(key.as_bytes())) {
            found.entry(owner.port).or_insert(key);
        }
    }

    RefreshKeySet {
        covered: found.len(),
        nodes: nodes.len(),
        keys: nodes.iter().filter_map(|n| found.remove(&n.port)).collect(),
    }
}

#[derive(Default)]
struct KeyState {
    computed_for: Option<TopologySnapshot>,
    keys: Vec<String>,
}

struct ClusterKeeperInner {
    factory: ConnectionFactory,
    max_probe_keys: usize,
    key_ttl: Duration,
    connections: Mutex<Vec<ConnectionHandle>>,
    pushed: ArcSwapOption<TopologySnapshot>,
    keys: Mutex<KeyState>,
    cycle: tokio::sync::Mutex<()>,
}

/// Keeps every per-master socket of cluster connections alive.
///
/// A cluster connection holds one socket per master and a ping only
/// reaches one of them, so each pass writes and deletes one short-lived
/// key per master instead.
pub struct ClusterConnectionKeeper {
    inner: Arc<ClusterKeeperInner>,
    periodic: Periodic,
}

impl ClusterConnectionKeeper {
    pub fn new(factory: ConnectionFactory, config: &KeeperConfig) -> Self {
        Self {
            inner: Arc::new(ClusterKeeperInner {
                factory,
                max_probe_keys: config.max_probe_keys,
                key_ttl: config.refresh_key_ttl,
                connections: Mutex::new(Vec::new()),
                pushed: ArcSwapOption::empty(),
                keys: Mutex::new(KeyState::default()),
                cycle: tokio::sync::Mutex::new(()),
            }),
            periodic: Periodic::new("cluster-connection-keeper", config.refresh_connection_interval),
        }
    }

    /// Take slot ownership from `monitor` instead of fetching it each pass.
    pub fn attach(&self, monitor: &TopologyMonitor) -> TopologySubscription {
        monitor.on_topology_change(Arc::new(SnapshotFeed(self.inner.clone())))
    }

    pub fn add(&self, handle: &ConnectionHandle) -> bool {
        track(&self.inner.connections, handle)
    }

    pub fn remove(&self, handle: &ConnectionHandle) -> bool {
        untrack(&self.inner.connections, handle)
    }

    pub fn tracked(&self) -> usize {
        lock(&self.inner.connections).len()
    }

    /// Keys the next pass will touch.
    pub fn refresh_keys(&self) -> Vec<String> {
        lock(&self.inner.keys).keys.clone()
    }

    pub async fn refresh_once(&self) -> RefreshOutcome {
        self.inner.refresh_once().await
    }

    pub fn start(&self) -> bool {
        let inner = self.inner.clone();
        self.periodic.start(move || {
            let inner = inner.clone();
            async move {
                inner.refresh_once().await;
            }
        })
    }

    pub fn stop(&self) -> bool {
        self.periodic.stop()
    }

    pub fn is_running(&self) -> bool {
        self.periodic.is_running()
    }

    pub async fn shutdown(&self) {
        self.periodic.shutdown().await
    }
}

impl ClusterKeeperInner {
    async fn refresh_once(&self) -> RefreshOutcome {
        let _cycle = self.cycle.lock().await;

        if let Err(e) = self.generate_refresh_keys().await {
            tracing::error!("Generate refresh keys failed: {}", e);
        }

        let keys = lock(&self.keys).keys.clone();
        let connections: Vec<ConnectionHandle> = lock(&self.connections).clone();
        let mut outcome = RefreshOutcome::default();

        for handle in &connections {
            for key in &keys {
                tracing::info!(connection = %handle.name(), key = %key, "Refresh cluster connection");
                match self.touch(handle, key).await {
                    Ok(()) => outcome.succeeded += 1,
                    Err(e) => {
                        outcome.failed += 1;
                        tracing::error!(
                            connection = %handle.name(),
                            key = %key,
                            "Refresh cluster connection failed: {}",
                            e
                        );
                    }
                }
            }
        }
        outcome
    }

    async fn touch(&self, handle: &ConnectionHandle, key: &str) -> Result<(), Error> {
        let value = Uuid::new_v4().to_string();
        handle.set_ex(key, &value, self.key_ttl).await?;
        handle.del(key).await?;
        Ok(())
    }

    async fn generate_refresh_keys(&self) -> Result<(), Error> {
        let snapshot = match self.pushed.load_full() {
            Some(snapshot) => (*snapshot).clone(),
            None => self.fetch_slots().await?,
        };
        if snapshot.is_empty() {
            return Err(Error::Topology("cluster reported no slot ranges".to_string()));
        }

        if lock(&self.keys).computed_for.as_ref() == Some(&snapshot) {
            tracing::debug!("Hash slots unchanged, keeping refresh keys");
            return Ok(());
        }

        tracing::info!("Hash slots changed, generating refresh keys");
        let settings = self.factory.settings();
        let found = representative_keys(&snapshot, self.max_probe_keys, || {
            settings.prefixed(&Uuid::new_v4().to_string())
        });

        let mut state = lock(&self.keys);
        if found.is_complete() {
            state.computed_for = Some(snapshot);
        } else {
            tracing::warn!(
                covered = found.covered,
                nodes = found.nodes,
                probes = self.max_probe_keys,
                "Could not find a refresh key for every node, retrying next pass"
            );
            state.computed_for = None;
        }
        state.keys = found.keys;
        Ok(())
    }

    async fn fetch_slots(&self) -> Result<TopologySnapshot, Error> {
        let probe = self.factory.standalone("slot-probe");
        probe.connect().await?;
        let result = probe.cluster_slots().await;
        if let Err(e) = probe.disconnect().await {
            tracing::debug!(connection = %probe.name(), "Disconnect failed: {}", e);
        }
        result
    }
}

struct SnapshotFeed(Arc<ClusterKeeperInner>);

#[async_trait]
impl TopologyObserver for SnapshotFeed {
    async fn on_topology_change(&self, event: &TopologyChangeEvent) {
        self.0.pushed.store(Some(event.snapshot.clone()));
    }
}
