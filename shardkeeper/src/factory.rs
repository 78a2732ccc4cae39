use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::address::{external_host_map, NodeAddress, NodeAddressMap};
use crate::config::{KeeperConfig, RedisSettings};
use crate::connection::{ConnectionHandle, Driver, LifecycleObserver};
use crate::redis_driver::RedisDriver;

/// Whether a session talks to one node or routes across the cluster.
#[derive(Clone)]
pub enum ConnectionMode {
    Standalone,
    Cluster { node_address_map: NodeAddressMap },
}

impl fmt::Debug for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionMode::Standalone => f.write_str("Standalone"),
            ConnectionMode::Cluster { .. } => f.write_str("Cluster"),
        }
    }
}

/// Everything a driver needs to open one session.
#[derive(Clone)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: bool,
    pub database: Option<i64>,
    pub purpose: String,
    pub mode: ConnectionMode,
    pub connect_retries: u32,
    pub command_timeout: Duration,
}

impl ConnectionParams {
    pub fn address(&self) -> NodeAddress {
        NodeAddress::new(self.host.clone(), self.port)
    }

    pub fn is_cluster(&self) -> bool {
        matches!(self.mode, ConnectionMode::Cluster { .. })
    }
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("tls", &self.tls)
            .field("database", &self.database)
            .field("purpose", &self.purpose)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Builds connection handles from one set of settings.
///
/// Every handle gets a unique name (`<client>-<purpose>-<host>:<port>-<suffix>`)
/// and a logging observer for its lifecycle.
#[derive(Clone)]
pub struct ConnectionFactory {
    driver: Arc<dyn Driver>,
    settings: RedisSettings,
    connect_retries: u32,
    command_timeout: Duration,
    node_address_map: NodeAddressMap,
}

impl ConnectionFactory {
    pub fn new(driver: Arc<dyn Driver>, config: &KeeperConfig) -> Self {
        Self {
            driver,
            node_address_map: external_host_map(&config.redis.host, config.redis.port),
            settings: config.redis.clone(),
            connect_retries: config.connect_retries,
            command_timeout: config.command_timeout,
        }
    }

    /// Factory backed by the real Redis transport.
    pub fn redis(config: &KeeperConfig) -> Self {
        Self::new(Arc::new(RedisDriver::new()), config)
    }

    /// Replace the default node address remapping.
    pub fn with_node_address_map(mut self, map: NodeAddressMap) -> Self {
        self.node_address_map = map;
        self
    }

    pub fn settings(&self) -> &RedisSettings {
        &self.settings
    }

    pub fn map_node_address(&self, raw: &str) -> NodeAddress {
        (self.node_address_map)(raw)
    }

    /// Connection to the configured endpoint.
    pub fn standalone(&self, purpose: &str) -> ConnectionHandle {
        self.build(
            purpose,
            self.settings.host.clone(),
            self.settings.port,
            self.settings.database,
            ConnectionMode::Standalone,
        )
    }

    /// Connection to one shard. Shards only have database 0.
    pub fn node(&self, purpose: &str, address: &NodeAddress) -> ConnectionHandle {
        self.build(
            purpose,
            address.host.clone(),
            address.port,
            None,
            ConnectionMode::Standalone,
        )
    }

    /// Slot-routing connection seeded from the configured endpoint.
    pub fn cluster(&self, purpose: &str) -> ConnectionHandle {
        self.build(
            purpose,
            self.settings.host.clone(),
            self.settings.port,
            None,
            ConnectionMode::Cluster {
                node_address_map: self.node_address_map.clone(),
            },
        )
    }

    fn build(
        &self,
        purpose: &str,
        host: String,
        port: u16,
        database: Option<i64>,
        mode: ConnectionMode,
    ) -> ConnectionHandle {
        let suffix = Uuid::new_v4().simple().to_string();
        let name = format!(
            "{}-{}-{}:{}-{}",
            self.settings.client_name,
            purpose,
            host,
            port,
            &suffix[..8]
        );

        let params = ConnectionParams {
            host,
            port,
            username: self.settings.username.clone(),
            password: self.settings.password.clone(),
            tls: self.settings.tls,
            database,
            purpose: purpose.to_string(),
            mode,
            connect_retries: self.connect_retries,
            command_timeout: self.command_timeout,
        };

        tracing::info!(connection = %name, "Create connection");
        tracing::debug!(connection = %name, params = ?params, "Connection parameters");

        let handle = ConnectionHandle::new(name, params, self.driver.clone());
        handle.observe(Arc::new(LoggingObserver));
        handle
    }
}

/// Logs every lifecycle event of a connection.
struct LoggingObserver;

#[async_trait]
impl LifecycleObserver for LoggingObserver {
    async fn on_connecting(&self, handle: &ConnectionHandle) {
        tracing::info!(connection = %handle.name(), "Initiating connection");
    }

    async fn on_ready(&self, handle: &ConnectionHandle) {
        tracing::info!(connection = %handle.name(), "Connection ready");
    }

    async fn on_error(&self, handle: &ConnectionHandle, error: &str) {
        tracing::error!(connection = %handle.name(), "Connection error: {}", error);
    }

    async fn on_reconnecting(&self, handle: &ConnectionHandle) {
        tracing::info!(connection = %handle.name(), "Reconnecting");
    }

    async fn on_end(&self, handle: &ConnectionHandle) {
        tracing::info!(connection = %handle.name(), "Connection ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCluster;

    fn factory() -> ConnectionFactory {
        let mut config = KeeperConfig::default();
        config.redis.host = "cache.example.com".into();
        config.redis.port = 7000;
        config.redis.password = Some("hunter2".into());
        config.redis.database = Some(3);
        ConnectionFactory::new(MemoryCluster::new().driver(), &config)
    }

    #[test]
    fn test_names_are_unique_and_descriptive() {
        let factory = factory();
        let a = factory.standalone("keeper");
        let b = factory.standalone("keeper");

        assert!(a.name().starts_with("shardkeeper-keeper-cache.example.com:7000-"));
        assert_eq!(a.name().len(), b.name().len());
        assert_ne!(a.name(), b.name());
    }

    #[test]
    fn test_node_connection_targets_shard() {
        let factory = factory();
        let handle = factory.node("subscriber", &NodeAddress::new("cache.example.com", 7003));

        assert_eq!(handle.params().port, 7003);
        assert_eq!(handle.params().database, None);
        assert!(!handle.params().is_cluster());
        assert!(handle.name().contains("subscriber-cache.example.com:7003"));
    }

    #[test]
    fn test_standalone_keeps_database_and_cluster_drops_it() {
        let factory = factory();
        assert_eq!(factory.standalone("app").params().database, Some(3));

        let cluster = factory.cluster("app");
        assert!(cluster.params().is_cluster());
        assert_eq!(cluster.params().database, None);
    }

    #[test]
    fn test_default_map_keeps_configured_host() {
        let factory = factory();
        let mapped = factory.map_node_address("10.0.0.12:7005");
        assert_eq!(mapped.host, "cache.example.com");
        assert_eq!(mapped.port, 7005);
    }

    #[test]
    fn test_custom_map() {
        let factory = factory().with_node_address_map(Arc::new(|raw: &str| {
            NodeAddress::new("proxy", crate::address::parse_port(raw).unwrap_or(0) + 10000)
        }));
        assert_eq!(factory.map_node_address("10.0.0.12:7005").port, 17005);
    }

    #[test]
    fn test_params_debug_masks_password() {
        let rendered = format!("{:?}", factory().standalone("app").params());
        assert!(!rendered.contains("hunter2"));
    }
}
