// Directory-service contract consumed by the node runtime.
//
// The transport of the directory calls themselves (XML-RPC in classic
// deployments) is out of scope here; the runtime only depends on this trait
// and receives a handle at construction.
use async_trait::async_trait;

mod memory;

pub use memory::InMemoryRegistry;

/// The only stream transport this runtime negotiates.
pub const TCPROS: &str = "TCPROS";

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("registry unavailable: {0}")]
    Unavailable(String),
    #[error("registry rejected the call: {0}")]
    Rejected(String),
}

/// Negotiated transport parameters for one (publisher, topic) pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProtocolParams {
    pub protocol: String,
    pub host: String,
    pub port: u16,
}

/// Authoritative publisher list for one topic, as pushed by the registry.
#[derive(Clone, Debug)]
pub struct TopologyUpdate {
    pub topic: String,
    /// Node API URIs of every publisher currently advertising the topic.
    pub publishers: Vec<String>,
}

/// Calls the node runtime makes against the directory service.
#[async_trait]
pub trait Registry: Send + Sync + 'static {
    /// Register a subscription; returns the current publisher list.
    async fn register_subscriber(
        &self,
        caller_id: &str,
        topic: &str,
        type_name: &str,
        api_uri: &str,
    ) -> Result<Vec<String>>;

    async fn unregister_subscriber(&self, caller_id: &str, topic: &str, api_uri: &str)
        -> Result<()>;

    async fn register_publisher(
        &self,
        caller_id: &str,
        topic: &str,
        type_name: &str,
        api_uri: &str,
    ) -> Result<()>;

    async fn unregister_publisher(&self, caller_id: &str, topic: &str, api_uri: &str)
        -> Result<()>;

    /// Negotiate a transport for `topic` with the publisher behind
    /// `publisher_api_uri`. `protocols` lists the transports the caller
    /// supports, in preference order.
    async fn request_topic(
        &self,
        publisher_api_uri: &str,
        caller_id: &str,
        topic: &str,
        protocols: &[&str],
    ) -> Result<ProtocolParams>;
}
