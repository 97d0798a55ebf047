// Error taxonomies for the node surface and the connection layer.
use roslink_registry::RegistryError;

pub type Result<T> = std::result::Result<T, NodeError>;

/// Failures surfaced to application code through the node API.
#[derive(thiserror::Error, Debug)]
pub enum NodeError {
    #[error("registry unavailable: {0}")]
    RegistryUnavailable(#[from] RegistryError),
    #[error("unsupported protocol '{0}'")]
    UnsupportedProtocol(String),
    #[error("topic '{topic}' is already open with type {existing}")]
    TypeConflict { topic: String, existing: String },
    #[error("node is shut down")]
    ShutDown,
    #[error("config error: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures inside one connection worker. These never reach application
/// code; they are converted into disconnection notices consumed by the
/// subscription coordinator.
#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
    #[error("dial failed: {0}")]
    DialFailed(#[source] std::io::Error),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("malformed connection header: {0}")]
    MalformedHeader(#[source] roslink_wire::Error),
    #[error(
        "incompatible message type: got {got_type} ({got_md5sum}), \
         expected {want_type} ({want_md5sum})"
    )]
    IncompatibleType {
        want_type: String,
        got_type: String,
        want_md5sum: String,
        got_md5sum: String,
    },
    #[error("truncated message frame")]
    TruncatedFrame,
    #[error("connection fault: {0}")]
    IoFault(#[source] roslink_wire::Error),
}

impl ConnectionError {
    /// Whether the coordinator may re-dial this publisher on a later
    /// topology pass. A type mismatch will not resolve itself, so it stays
    /// blocked until the publisher re-registers.
    pub(crate) fn retryable(&self) -> bool {
        !matches!(self, Self::IncompatibleType { .. })
    }
}
