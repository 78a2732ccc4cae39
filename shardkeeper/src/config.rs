use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::Error;

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 6379;
const DEFAULT_CLIENT_NAME: &str = "shardkeeper";

const DEFAULT_CHECK_NODE_INTERVAL_SECS: u64 = 10;
/// Nine minutes: just under the ten-minute idle timeout common on load balancers.
const DEFAULT_REFRESH_CONNECTION_INTERVAL_SECS: u64 = 9 * 60;
const DEFAULT_RANDOM_KEY_MAX_NUM: usize = 100;
const DEFAULT_REFRESH_KEY_TTL_SECS: u64 = 60;
const DEFAULT_CONNECT_RETRIES: u32 = 5;
const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 5000;
const DEFAULT_WAIT_INTERVAL_MS: u64 = 500;
const DEFAULT_MAX_WAIT_COUNT: u32 = 20;

/// How to reach the store.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: bool,
    pub database: Option<i64>,
    pub key_prefix: Option<String>,
    pub cluster: bool,
    pub client_name: String,
}

impl RedisSettings {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            client_name: DEFAULT_CLIENT_NAME.to_string(),
            ..Default::default()
        }
    }

    /// Prefix a key generated by this layer.
    pub fn prefixed(&self, key: &str) -> String {
        match &self.key_prefix {
            Some(prefix) => format!("{}{}", prefix, key),
            None => key.to_string(),
        }
    }
}

impl fmt::Debug for RedisSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("tls", &self.tls)
            .field("database", &self.database)
            .field("key_prefix", &self.key_prefix)
            .field("cluster", &self.cluster)
            .field("client_name", &self.client_name)
            .finish()
    }
}

/// Full configuration surface: connection settings plus every interval
/// and limit used by the monitor, keepers and lazy holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeeperConfig {
    pub redis: RedisSettings,
    pub check_node_interval: Duration,
    pub refresh_connection_interval: Duration,
    pub max_probe_keys: usize,
    pub refresh_key_ttl: Duration,
    pub connect_retries: u32,
    pub command_timeout: Duration,
    pub wait_interval: Duration,
    pub max_wait_count: u32,
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            redis: RedisSettings::new(DEFAULT_HOST, DEFAULT_PORT),
            check_node_interval: Duration::from_secs(DEFAULT_CHECK_NODE_INTERVAL_SECS),
            refresh_connection_interval: Duration::from_secs(
                DEFAULT_REFRESH_CONNECTION_INTERVAL_SECS,
            ),
            max_probe_keys: DEFAULT_RANDOM_KEY_MAX_NUM,
            refresh_key_ttl: Duration::from_secs(DEFAULT_REFRESH_KEY_TTL_SECS),
            connect_retries: DEFAULT_CONNECT_RETRIES,
            command_timeout: Duration::from_millis(DEFAULT_COMMAND_TIMEOUT_MS),
            wait_interval: Duration::from_millis(DEFAULT_WAIT_INTERVAL_MS),
            max_wait_count: DEFAULT_MAX_WAIT_COUNT,
        }
    }
}

impl KeeperConfig {
    /// Read configuration from the process environment.
    ///
    /// Unset variables fall back to defaults.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` when a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Read configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let redis = RedisSettings {
            host: get("REDIS_HOST").unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: parse_var(&get, "REDIS_PORT")?.unwrap_or(DEFAULT_PORT),
            username: get("REDIS_USERNAME"),
            password: get("REDIS_PASSWORD"),
            tls: parse_flag(&get, "REDIS_TLS")?,
            database: parse_var(&get, "REDIS_DATABASE")?,
            key_prefix: get("REDIS_KEY_PREFIX"),
            cluster: parse_flag(&get, "REDIS_CLUSTER")?,
            client_name: get("REDIS_CLIENT_NAME")
                .unwrap_or_else(|| DEFAULT_CLIENT_NAME.to_string()),
        };

        Ok(Self {
            redis,
            check_node_interval: Duration::from_secs(
                parse_var(&get, "REDIS_CHECK_NODE_INTERVAL_SEC")?
                    .unwrap_or(DEFAULT_CHECK_NODE_INTERVAL_SECS),
            ),
            refresh_connection_interval: Duration::from_secs(
                parse_var(&get, "REDIS_REFRESH_CONNECTION_INTERVAL_SEC")?
                    .unwrap_or(DEFAULT_REFRESH_CONNECTION_INTERVAL_SECS),
            ),
            max_probe_keys: parse_var(&get, "REDIS_RANDOM_KEY_MAX_NUM")?
                .unwrap_or(DEFAULT_RANDOM_KEY_MAX_NUM),
            refresh_key_ttl: Duration::from_secs(
                parse_var(&get, "REDIS_REFRESH_KEY_TTL_SEC")?
                    .unwrap_or(DEFAULT_REFRESH_KEY_TTL_SECS),
            ),
            connect_retries: parse_var(&get, "REDIS_CONNECT_RETRIES")?
                .unwrap_or(DEFAULT_CONNECT_RETRIES),
            command_timeout: Duration::from_millis(
                parse_var(&get, "REDIS_COMMAND_TIMEOUT_MS")?.unwrap_or(DEFAULT_COMMAND_TIMEOUT_MS),
            ),
            wait_interval: Duration::from_millis(
                parse_var(&get, "WAIT_INTERVAL")?.unwrap_or(DEFAULT_WAIT_INTERVAL_MS),
            ),
            max_wait_count: parse_var(&get, "MAX_WAIT_COUNT")?.unwrap_or(DEFAULT_MAX_WAIT_COUNT),
        })
    }
}

fn parse_var<T, G>(get: &G, name: &str) -> Result<Option<T>, Error>
where
    T: FromStr,
    T::Err: fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{}={:?}: {}", name, raw, e))),
        None => Ok(None),
    }
}

fn parse_flag<G>(get: &G, name: &str) -> Result<bool, Error>
where
    G: Fn(&str) -> Option<String>,
{
    match get(name).as_deref().map(str::trim) {
        None => Ok(false),
        Some("1") | Some("true") | Some("yes") | Some("on") => Ok(true),
        Some("0") | Some("false") | Some("no") | Some("off") => Ok(false),
        Some(other) => Err(Error::Config(format!(
            "{}={:?}: expected true or false",
            name, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = KeeperConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, KeeperConfig::default());
        assert_eq!(config.redis.host, "localhost");
        assert_eq!(config.redis.port, 6379);
        assert_eq!(config.check_node_interval, Duration::from_secs(10));
        assert_eq!(config.refresh_connection_interval, Duration::from_secs(540));
        assert_eq!(config.max_probe_keys, 100);
        assert_eq!(config.wait_interval, Duration::from_millis(500));
        assert_eq!(config.max_wait_count, 20);
    }

    #[test]
    fn test_overrides() {
        let config = KeeperConfig::from_lookup(lookup(&[
            ("REDIS_HOST", "cache.internal"),
            ("REDIS_PORT", "7000"),
            ("REDIS_PASSWORD", "s3cret"),
            ("REDIS_TLS", "true"),
            ("REDIS_CLUSTER", "1"),
            ("REDIS_KEY_PREFIX", "app:"),
            ("REDIS_CHECK_NODE_INTERVAL_SEC", "3"),
            ("REDIS_REFRESH_CONNECTION_INTERVAL_SEC", "30"),
            ("REDIS_RANDOM_KEY_MAX_NUM", "250"),
            ("WAIT_INTERVAL", "50"),
            ("MAX_WAIT_COUNT", "4"),
        ]))
        .unwrap();

        assert_eq!(config.redis.host, "cache.internal");
        assert_eq!(config.redis.port, 7000);
        assert_eq!(config.redis.password.as_deref(), Some("s3cret"));
        assert!(config.redis.tls);
        assert!(config.redis.cluster);
        assert_eq!(config.redis.prefixed("probe"), "app:probe");
        assert_eq!(config.check_node_interval, Duration::from_secs(3));
        assert_eq!(config.refresh_connection_interval, Duration::from_secs(30));
        assert_eq!(config.max_probe_keys, 250);
        assert_eq!(config.wait_interval, Duration::from_millis(50));
        assert_eq!(config.max_wait_count, 4);
    }

    #[test]
    fn test_blank_values_fall_back_to_defaults() {
        let config = KeeperConfig::from_lookup(lookup(&[("REDIS_PORT", "  ")])).unwrap();
        assert_eq!(config.redis.port, 6379);
    }

    #[test]
    fn test_invalid_number_is_config_error() {
        let err = KeeperConfig::from_lookup(lookup(&[("REDIS_PORT", "seventy")])).unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("REDIS_PORT")));
    }

    #[test]
    fn test_invalid_flag_is_config_error() {
        let err = KeeperConfig::from_lookup(lookup(&[("REDIS_TLS", "maybe")])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_debug_masks_password() {
        let mut settings = RedisSettings::new("localhost", 6379);
        settings.password = Some("hunter2".into());
        let rendered = format!("{:?}", settings);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("***"));
    }

    #[test]
    #[serial]
    fn test_from_env_reads_process_environment() {
        std::env::set_var("REDIS_RANDOM_KEY_MAX_NUM", "42");
        let config = KeeperConfig::from_env().unwrap();
        std::env::remove_var("REDIS_RANDOM_KEY_MAX_NUM");
        assert_eq!(config.max_probe_keys, 42);
    }
}
