//! Connection resilience for Redis clusters.
//!
//! This crate provides:
//! - Lazily initialised connections that concurrent callers share
//! - Topology polling via `CLUSTER SLOTS` with node join/leave events
//! - Cluster-wide Pub/Sub: one subscribing connection per master, replaced
//!   on failure, with every channel replayed onto each new connection
//! - Keep-alive traffic for idle connections, including one short-lived
//!   key per master for cluster connections
//!
//! Works against self-hosted clusters and managed deployments that only
//! expose a single external host (node addresses are remapped to it).
//!
//! # Example
//!
//! ```rust,ignore
//! use shardkeeper::{ClusterSubscriber, ConnectionFactory, KeeperConfig, Listener, TopologyMonitor};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = KeeperConfig::from_env()?;
//!     let factory = ConnectionFactory::redis(&config);
//!
//!     // Follow the cluster and keep one subscriber per shard
//!     let monitor = TopologyMonitor::from_config(factory.clone(), &config);
//!     let subscriber = ClusterSubscriber::new(factory);
//!     let _attached = subscriber.attach(&monitor);
//!     monitor.start();
//!
//!     subscriber
//!         .subscribe(
//!             "__keyevent@0__:expired",
//!             Listener::new(|key, _channel| println!("expired: {}", key)),
//!         )
//!         .await;
//!
//!     tokio::signal::ctrl_c().await?;
//!     monitor.shutdown().await;
//!     subscriber.disconnect().await;
//!     Ok(())
//! }
//! ```
//!
//! # Failure handling
//!
//! - **Shard connection error**: a replacement connects, takes over the
//!   route, gets every channel replayed, then the failed one is closed
//! - **Topology fetch failure**: logged, the previous snapshot stays
//! - **Keep-alive failure**: logged per connection, the next tick runs as usual

use std::sync::{Mutex, MutexGuard, PoisonError};

mod address;
mod config;
mod connection;
mod error;
mod factory;
mod keeper;
mod lazy;
mod memory;
mod monitor;
mod redis_driver;
mod schedule;
mod subscriber;
mod topology;

pub use address::{external_host_map, parse_port, NodeAddress, NodeAddressMap};
pub use config::{KeeperConfig, RedisSettings};
pub use connection::{
    ConnectionHandle, ConnectionState, Driver, LifecycleEvent, LifecycleObserver, LifecycleSink,
    Listener, Session,
};
pub use error::Error;
pub use factory::{ConnectionFactory, ConnectionMode, ConnectionParams};
pub use keeper::{
    representative_keys, ClusterConnectionKeeper, ConnectionKeeper, RefreshKeySet, RefreshOutcome,
};
pub use lazy::{HolderState, LazyConnection};
pub use memory::MemoryCluster;
pub use monitor::{TopologyChangeEvent, TopologyMonitor, TopologyObserver, TopologySubscription};
pub use redis_driver::{connection_url, parse_cluster_slots, RedisDriver};
pub use subscriber::{ClusterSubscriber, NodeClientStatus, ShardEvent};
pub use topology::{key_slot, SlotRange, TopologyDiff, TopologySnapshot, SLOT_COUNT};

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
