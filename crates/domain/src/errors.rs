use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum ResolveError {
    #[error("Failed to encode DNS message: {0}")]
    MessageEncode(String),

    #[error("No connection available")]
    NoConnectionAvailable,

    #[error("Timed out sending to {server}")]
    SendTimeout { server: String },

    #[error("Socket error: {0}")]
    Socket(String),

    #[error("Only wrote {written} bytes of the {expected} byte message")]
    PartialWrite { written: usize, expected: usize },

    #[error("Exchange key {0} is already in use")]
    DuplicateExchange(String),

    #[error("Connection pool construction failed: {0}")]
    PoolConstruction(String),
}
