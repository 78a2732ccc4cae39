// Shared fixtures for scenario tests: an in-memory cluster and helpers to
// wait on background recovery.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use shardkeeper::{ConnectionFactory, KeeperConfig, Listener, MemoryCluster, NodeAddress, SlotRange};

pub const SEED_PORT: u16 = 7001;

pub fn range(from: u16, to: u16, port: u16) -> SlotRange {
    // Reported addresses are internal; the factory maps them to the seed host
    SlotRange::new(from, to, NodeAddress::new("10.0.0.1", port))
}

/// Cluster whose masters split the slot space evenly, in port order.
pub fn cluster(ports: &[u16]) -> MemoryCluster {
    let cluster = MemoryCluster::new();
    set_masters(&cluster, ports);
    cluster
}

pub fn set_masters(cluster: &MemoryCluster, ports: &[u16]) {
    let width = 16384 / ports.len() as u32;
    let ranges = ports
        .iter()
        .enumerate()
        .map(|(i, port)| {
            let from = i as u32 * width;
            let to = if i + 1 == ports.len() { 16383 } else { from + width - 1 };
            range(from as u16, to as u16, *port)
        })
        .collect();
    cluster.set_slots(ranges);
}

pub fn config() -> KeeperConfig {
    let mut config = KeeperConfig::default();
    config.redis.host = "127.0.0.1".to_string();
    config.redis.port = SEED_PORT;
    config.connect_retries = 0;
    config.check_node_interval = Duration::from_secs(10);
    config.refresh_connection_interval = Duration::from_secs(60);
    config
}

pub fn factory(cluster: &MemoryCluster, config: &KeeperConfig) -> ConnectionFactory {
    ConnectionFactory::new(cluster.driver(), config)
}

/// Listener that counts deliveries.
pub fn counting_listener() -> (Listener, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    let listener = Listener::new(move |_message, _channel| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    (listener, count)
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
