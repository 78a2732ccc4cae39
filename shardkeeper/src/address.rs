//! Shard endpoint addresses and the external address remapping used when
//! the cluster reports internal addresses that are not dialable from here.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Network endpoint of one shard.
///
/// Hosts are uniform in a deployment (every shard is reached through the
/// same externally configured host), so identity is the port alone:
/// equality and hashing ignore `host`.
#[derive(Debug, Clone)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl PartialEq for NodeAddress {
    fn eq(&self, other: &Self) -> bool {
        self.port == other.port
    }
}

impl Eq for NodeAddress {}

impl Hash for NodeAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.port.hash(state);
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Maps a raw `"host:port"` reported by the cluster to the address this
/// process should dial.
pub type NodeAddressMap = Arc<dyn Fn(&str) -> NodeAddress + Send + Sync>;

/// Default remapping: keep the externally configured host, take the port
/// from the reported address, fall back to the configured port when the
/// reported address carries none.
pub fn external_host_map(host: &str, default_port: u16) -> NodeAddressMap {
    let host = host.to_string();
    Arc::new(move |raw: &str| {
        let port = parse_port(raw).unwrap_or(default_port);
        let mapped = NodeAddress::new(host.clone(), port);
        tracing::debug!(reported = raw, mapped = %mapped, "Mapped cluster node address");
        mapped
    })
}

/// Parse the port out of `host:port`, `host:port@cport` or
/// `host:port@cport,hostname`.
pub fn parse_port(raw: &str) -> Option<u16> {
    let raw = raw.split(',').next().unwrap_or(raw);
    let raw = raw.split('@').next().unwrap_or(raw);
    let (host, port) = raw.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    port.parse().ok()
}
