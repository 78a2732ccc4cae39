//! In-process cluster for tests and local development.
//!
//! [`MemoryCluster`] keeps slot ownership, per-node keyspaces and live
//! sessions in memory, and exposes fault injection so connection recovery
//! can be exercised without a real deployment.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::address::NodeAddress;
use crate::connection::{Driver, LifecycleSink, Listener, Session};
use crate::factory::{ConnectionMode, ConnectionParams};
use crate::topology::{key_slot, SlotRange, TopologySnapshot};
use crate::{lock, Error};

#[derive(Default)]
struct NodeState {
    refuse_connections: bool,
    fail_commands: bool,
    keys: HashMap<String, String>,
    connects: usize,
    pings: usize,
    writes: usize,
    deletes: usize,
}

struct SessionRecord {
    port: u16,
    sink: LifecycleSink,
    subscriptions: Vec<(String, Listener)>,
    broken: bool,
    closed: bool,
}

#[derive(Default)]
struct ClusterState {
    slots: Vec<SlotRange>,
    nodes: BTreeMap<u16, NodeState>,
    sessions: HashMap<u64, SessionRecord>,
    next_session: u64,
    slots_unavailable: bool,
    rejected_channels: HashSet<String>,
}

impl ClusterState {
    fn node_for_key(&self, key: &str) -> Result<u16, Error> {
        let slot = key_slot(key.as_bytes());
        self.slots
            .iter()
            .find(|r| r.contains(slot))
            .map(|r| r.master.port)
            .ok_or_else(|| Error::Topology(format!("slot {} is not served", slot)))
    }

    fn node_mut(&mut self, port: u16) -> Result<&mut NodeState, Error> {
        match self.nodes.get_mut(&port) {
            Some(node) if node.fail_commands => {
                Err(Error::Connection(format!("node {} is not responding", port)))
            }
            Some(node) => Ok(node),
            None => Err(Error::Connection(format!("node {} is gone", port))),
        }
    }
}

/// Shared in-memory cluster. Clones observe the same state.
#[derive(Clone, Default)]
pub struct MemoryCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Driver opening sessions against this cluster.
    pub fn driver(&self) -> Arc<dyn Driver> {
        Arc::new(MemoryDriver {
            cluster: self.clone(),
        })
    }

    /// Replace slot ownership. Masters that do not exist yet are created.
    pub fn set_slots(&self, slots: Vec<SlotRange>) {
        let mut state = lock(&self.state);
        for range in &slots {
            state.nodes.entry(range.master.port).or_default();
        }
        state.slots = slots;
    }

    pub fn add_node(&self, port: u16) {
        lock(&self.state).nodes.entry(port).or_default();
    }

    /// Remove a node and break every session connected to it.
    pub fn remove_node(&self, port: u16) {
        lock(&self.state).nodes.remove(&port);
        self.drop_sessions(port);
    }

    pub fn refuse_connections(&self, port: u16, refuse: bool) {
        lock(&self.state).nodes.entry(port).or_default().refuse_connections = refuse;
    }

    pub fn fail_commands(&self, port: u16, fail: bool) {
        lock(&self.state).nodes.entry(port).or_default().fail_commands = fail;
    }

    pub fn fail_slot_fetch(&self, fail: bool) {
        lock(&self.state).slots_unavailable = fail;
    }

    /// Answer subscriptions to `channel` with a permission error, the way
    /// an ACL without access to it would.
    pub fn reject_channel(&self, channel: &str, reject: bool) {
        let mut state = lock(&self.state);
        if reject {
            state.rejected_channels.insert(channel.to_string());
        } else {
            state.rejected_channels.remove(channel);
        }
    }

    /// Break every live session on `port`, as if the server reset them.
    /// Sessions report the loss through their lifecycle sink.
    pub fn drop_sessions(&self, port: u16) {
        let sinks: Vec<LifecycleSink> = {
            let mut state = lock(&self.state);
            state
                .sessions
                .values_mut()
                .filter(|s| s.port == port && !s.closed && !s.broken)
                .map(|s| {
                    s.broken = true;
                    s.subscriptions.clear();
                    s.sink.clone()
                })
                .collect()
        };
        for sink in sinks {
            sink.report_error(format!("connection to node {} was reset", port));
        }
    }

    /// Deliver `message` to every listener subscribed to `channel` on a
    /// live session. Returns the number of deliveries.
    pub fn publish(&self, channel: &str, message: &str) -> usize {
        let listeners: Vec<Listener> = {
            let state = lock(&self.state);
            state
                .sessions
                .values()
                .filter(|s| !s.closed && !s.broken)
                .flat_map(|s| s.subscriptions.iter())
                .filter(|(c, _)| c == channel)
                .map(|(_, l)| l.clone())
                .collect()
        };
        for listener in &listeners {
            listener.call(message, channel);
        }
        listeners.len()
    }

    /// Listener subscriptions to `channel` on live sessions of `port`.
    pub fn subscriptions(&self, port: u16, channel: &str) -> usize {
        lock(&self.state)
            .sessions
            .values()
            .filter(|s| s.port == port && !s.closed && !s.broken)
            .flat_map(|s| s.subscriptions.iter())
            .filter(|(c, _)| c == channel)
            .count()
    }

    pub fn open_sessions(&self, port: u16) -> usize {
        lock(&self.state)
            .sessions
            .values()
            .filter(|s| s.port == port && !s.closed)
            .count()
    }

    pub fn connects(&self, port: u16) -> usize {
        self.node_stat(port, |n| n.connects)
    }

    pub fn pings(&self, port: u16) -> usize {
        self.node_stat(port, |n| n.pings)
    }

    pub fn writes(&self, port: u16) -> usize {
        self.node_stat(port, |n| n.writes)
    }

    pub fn deletes(&self, port: u16) -> usize {
        self.node_stat(port, |n| n.deletes)
    }

    pub fn key_count(&self, port: u16) -> usize {
        self.node_stat(port, |n| n.keys.len())
    }

    fn node_stat(&self, port: u16, f: impl Fn(&NodeState) -> usize) -> usize {
        lock(&self.state).nodes.get(&port).map(f).unwrap_or(0)
    }
}

struct MemoryDriver {
    cluster: MemoryCluster,
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn open(
        &self,
        params: &ConnectionParams,
        sink: LifecycleSink,
    ) -> Result<Arc<dyn Session>, Error> {
        let mut state = lock(&self.cluster.state);
        match state.nodes.get_mut(&params.port) {
            Some(node) if !node.refuse_connections => node.connects += 1,
            _ => {
                return Err(Error::Connection(format!(
                    "connection refused: {}",
                    params.address()
                )))
            }
        }

        let id = state.next_session;
        state.next_session += 1;
        state.sessions.insert(
            id,
            SessionRecord {
                port: params.port,
                sink,
                subscriptions: Vec::new(),
                broken: false,
                closed: false,
            },
        );

        Ok(Arc::new(MemorySession {
            id,
            port: params.port,
            routed: matches!(params.mode, ConnectionMode::Cluster { .. }),
            cluster: self.cluster.clone(),
        }))
    }
}

struct MemorySession {
    id: u64,
    port: u16,
    routed: bool,
    cluster: MemoryCluster,
}

impl MemorySession {
    /// Run `f` against the node serving `key` (or this session's node).
    fn with_node<T>(
        &self,
        key: Option<&str>,
        f: impl FnOnce(&mut NodeState) -> T,
    ) -> Result<T, Error> {
        let mut state = lock(&self.cluster.state);
        self.check_alive(&state)?;
        let port = match key {
            Some(key) if self.routed => state.node_for_key(key)?,
            _ => self.port,
        };
        Ok(f(state.node_mut(port)?))
    }

    fn check_alive(&self, state: &ClusterState) -> Result<(), Error> {
        match state.sessions.get(&self.id) {
            Some(s) if s.closed => Err(Error::Closed(format!("session {}", self.id))),
            Some(s) if s.broken => Err(Error::Connection(format!(
                "connection to node {} was reset",
                self.port
            ))),
            Some(_) => Ok(()),
            None => Err(Error::Closed(format!("session {}", self.id))),
        }
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn ping(&self) -> Result<(), Error> {
        if !self.routed {
            return self.with_node(None, |n| n.pings += 1);
        }

        let mut state = lock(&self.cluster.state);
        self.check_alive(&state)?;
        let ports: Vec<u16> = TopologySnapshot::new(state.slots.clone())
            .nodes()
            .iter()
            .map(|n| n.port)
            .collect();
        for port in ports {
            state.node_mut(port)?.pings += 1;
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        self.with_node(Some(key), |n| n.keys.get(key).cloned())
    }

    async fn set_ex(&self, key: &str, value: &str, _ttl: Duration) -> Result<(), Error> {
        self.with_node(Some(key), |n| {
            n.writes += 1;
            n.keys.insert(key.to_string(), value.to_string());
        })
    }

    async fn del(&self, key: &str) -> Result<u64, Error> {
        self.with_node(Some(key), |n| {
            n.deletes += 1;
            u64::from(n.keys.remove(key).is_some())
        })
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<u64, Error> {
        self.with_node(None, |_| ())?;
        Ok(self.cluster.publish(channel, message) as u64)
    }

    async fn subscribe(&self, channel: &str, listener: Listener) -> Result<(), Error> {
        if self.routed {
            return Err(Error::Unsupported(
                "subscribe on a cluster-routed session".to_string(),
            ));
        }
        let mut state = lock(&self.cluster.state);
        self.check_alive(&state)?;
        state.node_mut(self.port)?;
        if state.rejected_channels.contains(channel) {
            return Err(Error::Redis(redis::RedisError::from((
                redis::ErrorKind::ResponseError,
                "NOPERM",
                format!("no permissions to access the '{}' channel", channel),
            ))));
        }
        if let Some(record) = state.sessions.get_mut(&self.id) {
            record.subscriptions.push((channel.to_string(), listener));
        }
        Ok(())
    }

    async fn cluster_slots(&self) -> Result<TopologySnapshot, Error> {
        let mut state = lock(&self.cluster.state);
        self.check_alive(&state)?;
        state.node_mut(self.port)?;
        if state.slots_unavailable {
            return Err(Error::Topology("CLUSTER SLOTS is not available".to_string()));
        }
        Ok(TopologySnapshot::new(
            state
                .slots
                .iter()
                .map(|r| {
                    SlotRange::new(r.from, r.to, NodeAddress::new("127.0.0.1", r.master.port))
                })
                .collect(),
        ))
    }

    async fn close(&self) -> Result<(), Error> {
        if let Some(record) = lock(&self.cluster.state).sessions.get_mut(&self.id) {
            record.closed = true;
            record.subscriptions.clear();
        }
        Ok(())
    }
}
