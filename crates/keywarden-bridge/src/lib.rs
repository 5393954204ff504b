pub mod config;
pub mod retry;
pub mod session;
pub mod supervisor;
pub mod transport;

pub use config::{fingerprint_of, Bootstrap, BootstrapPayload};
pub use session::{Session, SessionContext};
pub use supervisor::Supervisor;

#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    #[error("missing or invalid bootstrap field: {0}")]
    Config(&'static str),
    #[error("connection failed after {attempts} attempts: {source}")]
    Connection {
        attempts: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("pinned certificate mismatch: expected {expected}, presented {presented}")]
    Security { expected: String, presented: String },
    #[error("relay rejected the auth token")]
    Authentication,
    #[error("protocol error: {0}")]
    Protocol(#[from] keywarden_proto::ProtoError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Only plain connect/io failures are worth another attempt. A pin
    /// mismatch or rejected token is treated as hostile and fails closed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BridgeError::Io(_) | BridgeError::Connection { .. })
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
