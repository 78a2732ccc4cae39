use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection {0} is not ready")]
    NotReady(String),

    #[error("Connection {0} is closed")]
    Closed(String),

    #[error("Command on {name} timed out after {after_ms}ms")]
    Timeout { name: String, after_ms: u64 },

    #[error("Topology error: {0}")]
    Topology(String),

    #[error("Initialization failed: {0}")]
    Initialization(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

impl Error {
    /// Whether the failure came from the transport rather than from a
    /// server reply. Only transport failures drive lifecycle `Error` events.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::Redis(e) => {
                e.is_io_error()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
                    || e.is_timeout()
            }
            Error::Connection(_) | Error::Timeout { .. } => true,
            _ => false,
        }
    }
}
