use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::address::NodeAddress;
use crate::config::KeeperConfig;
use crate::connection::{ConnectionHandle, ConnectionState};
use crate::factory::ConnectionFactory;
use crate::schedule::Periodic;
use crate::topology::{TopologyDiff, TopologySnapshot};
use crate::{lock, Error};

/// Published when slot ownership changed.
#[derive(Debug, Clone)]
pub struct TopologyChangeEvent {
    /// Every master in the new snapshot.
    pub nodes: Vec<NodeAddress>,
    pub added_nodes: Vec<NodeAddress>,
    pub removed_nodes: Vec<NodeAddress>,
    pub snapshot: Arc<TopologySnapshot>,
}

/// Reacts to topology changes. Awaited before the monitor's next cycle.
#[async_trait]
pub trait TopologyObserver: Send + Sync {
    async fn on_topology_change(&self, event: &TopologyChangeEvent);
}

type ObserverList = Mutex<Vec<(u64, Arc<dyn TopologyObserver>)>>;

/// Registration of a [`TopologyObserver`]. Dropping it unsubscribes.
pub struct TopologySubscription {
    id: u64,
    observers: Weak<ObserverList>,
}

impl TopologySubscription {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for TopologySubscription {
    fn drop(&mut self) {
        if let Some(observers) = self.observers.upgrade() {
            lock(&observers).retain(|(id, _)| *id != self.id);
        }
    }
}

struct MonitorInner {
    factory: ConnectionFactory,
    base: ConnectionHandle,
    snapshot: ArcSwap<TopologySnapshot>,
    observers: Arc<ObserverList>,
    next_observer_id: AtomicU64,
    event_tx: broadcast::Sender<TopologyChangeEvent>,
    cycle: tokio::sync::Mutex<()>,
}

/// Polls slot ownership and publishes node membership changes.
///
/// The current snapshot is readable lock-free at any time.
pub struct TopologyMonitor {
    inner: Arc<MonitorInner>,
    periodic: Periodic,
}

impl TopologyMonitor {
    pub fn new(factory: ConnectionFactory, interval: Duration) -> Self {
        let base = factory.standalone("monitor");
        let (event_tx, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(MonitorInner {
                factory,
                base,
                snapshot: ArcSwap::from_pointee(TopologySnapshot::default()),
                observers: Arc::new(Mutex::new(Vec::new())),
                next_observer_id: AtomicU64::new(0),
                event_tx,
                cycle: tokio::sync::Mutex::new(()),
            }),
            periodic: Periodic::new("topology-monitor", interval),
        }
    }

    pub fn from_config(factory: ConnectionFactory, config: &KeeperConfig) -> Self {
        Self::new(factory, config.check_node_interval)
    }

    /// Current snapshot. Empty until the first successful poll.
    ///
    /// This is a lock-free operation using atomic pointer loading.
    pub fn snapshot(&self) -> Arc<TopologySnapshot> {
        self.inner.snapshot.load_full()
    }

    pub fn on_topology_change(&self, observer: Arc<dyn TopologyObserver>) -> TopologySubscription {
        let id = self.inner.next_observer_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.observers).push((id, observer));
        TopologySubscription {
            id,
            observers: Arc::downgrade(&self.inner.observers),
        }
    }

    /// Subscribe to change events.
    ///
    /// Events are broadcast AFTER every observer applied the change.
    pub fn events(&self) -> broadcast::Receiver<TopologyChangeEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Run one poll cycle now. Returns the published event, if any.
    pub async fn poll_once(&self) -> Option<TopologyChangeEvent> {
        self.inner.poll_once().await
    }

    /// Start polling. The first cycle runs immediately.
    pub fn start(&self) -> bool {
        let inner = self.inner.clone();
        let started = self.periodic.start(move || {
            let inner = inner.clone();
            async move {
                inner.poll_once().await;
            }
        });
        if started {
            tracing::info!("Topology monitor started");
        }
        started
    }

    pub fn stop(&self) -> bool {
        let stopped = self.periodic.stop();
        if stopped {
            tracing::info!("Topology monitor stopped");
        }
        stopped
    }

    pub fn is_running(&self) -> bool {
        self.periodic.is_running()
    }

    /// Stop polling, wait for the current cycle and close the base connection.
    pub async fn shutdown(&self) {
        self.periodic.shutdown().await;
        if let Err(e) = self.inner.base.disconnect().await {
            tracing::warn!("Disconnect topology monitor connection failed: {}", e);
        }
    }
}

impl MonitorInner {
    async fn poll_once(&self) -> Option<TopologyChangeEvent> {
        let _cycle = self.cycle.lock().await;

        let current = match self.fetch().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!("Fetch cluster slots failed: {}", e);
                return None;
            }
        };

        if current.is_empty() {
            tracing::warn!("Cluster reported no slot ranges, keeping previous topology");
            return None;
        }

        let previous = self.snapshot.load_full();
        if *previous == current {
            tracing::trace!("Cluster topology unchanged");
            return None;
        }

        let diff = TopologyDiff::between(&previous, &current);
        let snapshot = Arc::new(current);
        self.snapshot.store(snapshot.clone());

        let event = TopologyChangeEvent {
            nodes: snapshot.nodes(),
            added_nodes: diff.added,
            removed_nodes: diff.removed,
            snapshot,
        };

        tracing::info!(
            nodes = event.nodes.len(),
            added = event.added_nodes.len(),
            removed = event.removed_nodes.len(),
            "Cluster topology changed"
        );
        for node in &event.added_nodes {
            tracing::debug!(node = %node, "Node joined");
        }
        for node in &event.removed_nodes {
            tracing::debug!(node = %node, "Node left");
        }

        let observers: Vec<Arc<dyn TopologyObserver>> = lock(&self.observers)
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();
        for observer in observers {
            observer.on_topology_change(&event).await;
        }

        let _ = self.event_tx.send(event.clone());
        Some(event)
    }

    async fn fetch(&self) -> Result<TopologySnapshot, Error> {
        if self.base.state() == ConnectionState::Idle {
            self.base.connect().await?;
        }
        let reported = self.base.cluster_slots().await?;
        Ok(reported.map_nodes(|node| self.factory.map_node_address(&node.to_string())))
    }
}
