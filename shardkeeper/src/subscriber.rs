//! Pub/Sub across every shard of a cluster.
//!
//! Keyspace notifications are emitted per node, so listening to a channel
//! cluster-wide means one subscribing connection per master. The
//! [`ClusterSubscriber`] keeps that set in line with the topology, replaces
//! connections that fail, and replays the full channel registry onto every
//! connection that becomes ready.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::broadcast;

use crate::address::NodeAddress;
use crate::connection::{ConnectionHandle, LifecycleObserver, Listener};
use crate::factory::ConnectionFactory;
use crate::monitor::{TopologyChangeEvent, TopologyMonitor, TopologyObserver, TopologySubscription};
use crate::{lock, Error};

const PURPOSE: &str = "subscriber";
const MAX_BACKOFF_EXPONENT: u32 = 6;

/// Status of one shard connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeClientStatus {
    Connecting,
    /// Standing in for a routed connection that failed.
    Replacing,
    Ready,
    Error,
}

/// Raised once a shard connection is routed and has every registered
/// channel subscribed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardEvent {
    Ready {
        address: NodeAddress,
        connection: String,
    },
    Replaced {
        address: NodeAddress,
        connection: String,
        replaced: String,
    },
    Removed {
        address: NodeAddress,
    },
}

struct SubscriberInner {
    factory: ConnectionFactory,
    live_nodes: Mutex<HashMap<u16, NodeAddress>>,
    routes: Mutex<HashMap<u16, ConnectionHandle>>,
    statuses: Mutex<HashMap<String, NodeClientStatus>>,
    registry: Mutex<BTreeMap<String, HashSet<Listener>>>,
    event_tx: broadcast::Sender<ShardEvent>,
}

/// Subscribes listeners on every shard and keeps them subscribed through
/// topology changes and connection failures.
#[derive(Clone)]
pub struct ClusterSubscriber {
    inner: Arc<SubscriberInner>,
}

impl ClusterSubscriber {
    pub fn new(factory: ConnectionFactory) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(SubscriberInner {
                factory,
                live_nodes: Mutex::new(HashMap::new()),
                routes: Mutex::new(HashMap::new()),
                statuses: Mutex::new(HashMap::new()),
                registry: Mutex::new(BTreeMap::new()),
                event_tx,
            }),
        }
    }

    /// Follow `monitor`'s topology. Keep the returned subscription alive
    /// for as long as the subscriber should track the cluster.
    pub fn attach(&self, monitor: &TopologyMonitor) -> TopologySubscription {
        monitor.on_topology_change(Arc::new(self.clone()))
    }

    /// Connect added shards and drop removed ones. Returns once every
    /// added shard is connected (or gave up) and every removed one closed.
    pub async fn apply_topology_change(&self, event: &TopologyChangeEvent) {
        self.inner.apply_topology_change(event).await
    }

    /// Register `listener` for `channel` and subscribe it on every routed
    /// shard. Shards connecting later pick it up from the registry.
    ///
    /// Registering the same listener twice for a channel is a no-op.
    pub async fn subscribe(&self, channel: &str, listener: Listener) {
        let registered = lock(&self.inner.registry)
            .entry(channel.to_string())
            .or_default()
            .insert(listener.clone());
        if !registered {
            tracing::debug!(channel, "Listener already registered");
            return;
        }

        let handles: Vec<ConnectionHandle> = lock(&self.inner.routes).values().cloned().collect();
        tracing::info!(channel, shards = handles.len(), "Subscribe channel");

        let results = join_all(handles.iter().map(|h| h.subscribe(channel, listener.clone()))).await;
        for (handle, result) in handles.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(
                    connection = %handle.name(),
                    channel,
                    "Subscribe failed, the connection will be recovered: {}",
                    e
                );
            }
        }
    }

    /// Close every shard connection and forget the topology. The channel
    /// registry is kept.
    pub async fn disconnect(&self) {
        lock(&self.inner.live_nodes).clear();
        let handles: Vec<ConnectionHandle> = lock(&self.inner.routes).drain().map(|(_, h)| h).collect();
        for handle in handles {
            if let Err(e) = handle.disconnect().await {
                tracing::warn!(connection = %handle.name(), "Disconnect failed: {}", e);
            }
        }
    }

    /// Ports with a routed connection, ascending.
    pub fn routed_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = lock(&self.inner.routes).keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    pub fn routed_connection(&self, port: u16) -> Option<ConnectionHandle> {
        lock(&self.inner.routes).get(&port).cloned()
    }

    pub fn status_of(&self, connection: &str) -> Option<NodeClientStatus> {
        lock(&self.inner.statuses).get(connection).copied()
    }

    pub fn channels(&self) -> Vec<String> {
        lock(&self.inner.registry).keys().cloned().collect()
    }

    pub fn events(&self) -> broadcast::Receiver<ShardEvent> {
        self.inner.event_tx.subscribe()
    }
}

#[async_trait]
impl TopologyObserver for ClusterSubscriber {
    async fn on_topology_change(&self, event: &TopologyChangeEvent) {
        self.inner.apply_topology_change(event).await
    }
}

impl SubscriberInner {
    async fn apply_topology_change(self: &Arc<Self>, event: &TopologyChangeEvent) {
        {
            let mut live = lock(&self.live_nodes);
            for node in &event.removed_nodes {
                live.remove(&node.port);
            }
            for node in &event.added_nodes {
                live.insert(node.port, node.clone());
            }
        }

        let connects = join_all(event.added_nodes.iter().map(|n| self.connect_node(n.clone())));
        let disconnects = join_all(event.removed_nodes.iter().map(|n| self.disconnect_node(n)));
        tokio::join!(connects, disconnects);
    }

    fn create_connection(self: &Arc<Self>, address: &NodeAddress, status: NodeClientStatus) -> ConnectionHandle {
        let handle = self.factory.node(PURPOSE, address);
        lock(&self.statuses).insert(handle.name().to_string(), status);
        handle.observe(Arc::new(NodeObserver {
            subscriber: Arc::downgrade(self),
            address: address.clone(),
        }));
        handle
    }

    async fn connect_node(self: &Arc<Self>, address: NodeAddress) {
        tracing::info!(node = %address, "Connect to cluster node");
        let handle = self.create_connection(&address, NodeClientStatus::Connecting);
        match handle.connect().await {
            Ok(()) | Err(Error::Closed(_)) => {}
            Err(e) => {
                tracing::error!(
                    node = %address,
                    connection = %handle.name(),
                    "Connect to cluster node failed: {}, retrying in background",
                    e
                );
                let port = address.port;
                self.spawn_connect_retry(handle, 1, move |s| s.needs_route(port));
            }
        }
    }

    async fn disconnect_node(&self, address: &NodeAddress) {
        tracing::info!(node = %address, "Disconnect cluster node");
        let handle = lock(&self.routes).remove(&address.port);
        match handle {
            Some(handle) => {
                if let Err(e) = handle.disconnect().await {
                    tracing::error!(connection = %handle.name(), "Disconnect cluster node failed: {}", e);
                }
            }
            None => tracing::warn!(node = %address, "No routed connection for removed node"),
        }
        let _ = self.event_tx.send(ShardEvent::Removed {
            address: address.clone(),
        });
    }

    /// Update a tracked connection's status. Returns the previous status,
    /// or `None` if the connection is no longer tracked.
    fn transition(&self, handle: &ConnectionHandle, status: NodeClientStatus) -> Option<NodeClientStatus> {
        let mut statuses = lock(&self.statuses);
        let current = statuses.get_mut(handle.name())?;
        Some(std::mem::replace(current, status))
    }

    async fn on_ready(self: &Arc<Self>, handle: &ConnectionHandle, address: &NodeAddress) {
        let Some(previous) = self.transition(handle, NodeClientStatus::Ready) else {
            return;
        };

        if !lock(&self.live_nodes).contains_key(&address.port) {
            tracing::info!(
                connection = %handle.name(),
                node = %address,
                "Node left the cluster before its connection became ready, disconnecting"
            );
            if let Err(e) = handle.disconnect().await {
                tracing::debug!(connection = %handle.name(), "Disconnect failed: {}", e);
            }
            return;
        }

        if previous == NodeClientStatus::Replacing {
            tracing::info!(connection = %handle.name(), "Replacement is ready to take over");
        }

        let replaced = lock(&self.routes)
            .insert(address.port, handle.clone())
            .filter(|old| old != handle);

        match &replaced {
            Some(old) => {
                tracing::info!(
                    connection = %handle.name(),
                    replaced = %old.name(),
                    "Replaced node connection"
                );
                if let Err(e) = old.disconnect().await {
                    tracing::warn!(connection = %old.name(), "Disconnect replaced connection failed: {}", e);
                }
            }
            None if previous == NodeClientStatus::Replacing => {
                tracing::warn!(node = %address, "No existing connection found to replace");
            }
            None => {}
        }

        self.recover_subscription(handle).await;

        let event = match replaced {
            Some(old) => ShardEvent::Replaced {
                address: address.clone(),
                connection: handle.name().to_string(),
                replaced: old.name().to_string(),
            },
            None => ShardEvent::Ready {
                address: address.clone(),
                connection: handle.name().to_string(),
            },
        };
        let _ = self.event_tx.send(event);
    }

    fn on_error(self: &Arc<Self>, handle: &ConnectionHandle, address: &NodeAddress) {
        let previous = {
            let mut statuses = lock(&self.statuses);
            match statuses.get_mut(handle.name()) {
                Some(status) if *status == NodeClientStatus::Ready => {
                    *status = NodeClientStatus::Error;
                    Some(NodeClientStatus::Ready)
                }
                Some(status) => Some(*status),
                None => None,
            }
        };

        if previous != Some(NodeClientStatus::Ready) {
            return;
        }

        tracing::info!(connection = %handle.name(), "Connection failed after ready, creating a replacement");
        let replacement = self.create_connection(address, NodeClientStatus::Replacing);
        let failed = handle.clone();
        let port = address.port;
        self.spawn_connect_retry(replacement, 0, move |s| s.is_routed(port, &failed));
    }

    /// Keep connecting `handle` in the background, backing off after each
    /// failure, for as long as `still_needed` holds.
    fn spawn_connect_retry<F>(self: &Arc<Self>, handle: ConnectionHandle, failures: u32, still_needed: F)
    where
        F: Fn(&SubscriberInner) -> bool + Send + 'static,
    {
        let subscriber = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut consecutive_failures = failures;
            loop {
                if consecutive_failures > 0 {
                    let backoff_ms = 100 * 2u64.pow(consecutive_failures.min(MAX_BACKOFF_EXPONENT));
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;

                    let needed = subscriber.upgrade().is_some_and(|s| still_needed(&*s));
                    if !needed {
                        tracing::debug!(connection = %handle.name(), "Connection no longer needed, giving up");
                        if let Err(e) = handle.disconnect().await {
                            tracing::debug!(connection = %handle.name(), "Disconnect failed: {}", e);
                        }
                        return;
                    }
                }

                match handle.connect().await {
                    Ok(()) | Err(Error::Closed(_)) => return,
                    Err(e) => {
                        consecutive_failures += 1;
                        tracing::error!(
                            connection = %handle.name(),
                            failures = consecutive_failures,
                            "Connect failed: {}, backing off",
                            e
                        );
                    }
                }
            }
        });
    }

    fn on_end(&self, handle: &ConnectionHandle) {
        if lock(&self.statuses).remove(handle.name()).is_some() {
            tracing::debug!(connection = %handle.name(), "Node connection ended");
        }
    }

    /// The port is in the topology but nothing is routed to it yet.
    fn needs_route(&self, port: u16) -> bool {
        lock(&self.live_nodes).contains_key(&port) && !lock(&self.routes).contains_key(&port)
    }

    fn is_routed(&self, port: u16, handle: &ConnectionHandle) -> bool {
        lock(&self.live_nodes).contains_key(&port)
            && lock(&self.routes).get(&port).is_some_and(|h| h == handle)
    }

    /// Subscribe every registered (channel, listener) pair on `handle`.
    /// A transport failure stops the replay since the connection is being
    /// replaced; a rejected channel is logged and the rest still replay.
    async fn recover_subscription(&self, handle: &ConnectionHandle) {
        let plan: Vec<(String, Vec<Listener>)> = lock(&self.registry)
            .iter()
            .map(|(channel, listeners)| (channel.clone(), listeners.iter().cloned().collect()))
            .collect();

        tracing::info!(connection = %handle.name(), channels = plan.len(), "Recover subscription");
        for (channel, listeners) in plan {
            tracing::debug!(
                connection = %handle.name(),
                channel = %channel,
                listeners = listeners.len(),
                "Recover subscription channel"
            );
            for listener in listeners {
                match handle.subscribe(&channel, listener).await {
                    Ok(()) => {}
                    Err(e) if e.is_connection_error() || matches!(e, Error::Closed(_) | Error::NotReady(_)) => {
                        tracing::error!(
                            connection = %handle.name(),
                            channel = %channel,
                            "Recover subscription aborted, connection is failing: {}",
                            e
                        );
                        return;
                    }
                    Err(e) => {
                        tracing::error!(
                            connection = %handle.name(),
                            channel = %channel,
                            "Recover subscription channel rejected: {}",
                            e
                        );
                    }
                }
            }
        }
    }
}

struct NodeObserver {
    subscriber: Weak<SubscriberInner>,
    address: NodeAddress,
}

#[async_trait]
impl LifecycleObserver for NodeObserver {
    async fn on_ready(&self, handle: &ConnectionHandle) {
        if let Some(subscriber) = self.subscriber.upgrade() {
            subscriber.on_ready(handle, &self.address).await;
        }
    }

    async fn on_error(&self, handle: &ConnectionHandle, _error: &str) {
        if let Some(subscriber) = self.subscriber.upgrade() {
            subscriber.on_error(handle, &self.address);
        }
    }

    async fn on_end(&self, handle: &ConnectionHandle) {
        if let Some(subscriber) = self.subscriber.upgrade() {
            subscriber.on_end(handle);
        }
    }
}
