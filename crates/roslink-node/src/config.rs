// Node runtime tuning knobs and their defaults.
use crate::error::NodeError;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

// Channel depths for the coordinator fan-in loops. Control traffic is rare;
// the inbound payload channel absorbs short bursts from connection workers.
pub(crate) const CONTROL_QUEUE_DEPTH: usize = 16;
pub(crate) const INBOUND_QUEUE_DEPTH: usize = 64;
pub(crate) const PUBLISH_QUEUE_DEPTH: usize = 64;
pub(crate) const SUBSCRIBER_LINK_QUEUE_DEPTH: usize = 16;
pub(crate) const DISPATCH_QUEUE_DEPTH: usize = 1024;

/// Hard safety cap for any single inbound frame or handshake header.
///
/// Frame reads allocate a buffer sized by the peer's declared length; without
/// a cap, a buggy or hostile peer can advertise an enormous length and force
/// an OOM. Override with `ROSLINK_MAX_FRAME_BYTES`.
pub(crate) const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

const DEFAULT_DIAL_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_REDIAL_COOLDOWN_MS: u64 = 3_000;

/// Runtime configuration for one node.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Cap on any single frame or handshake header, in bytes.
    pub max_frame_bytes: usize,
    /// How long a connection worker waits for a TCP connect.
    pub dial_timeout_ms: u64,
    /// How long a connection worker waits for the response header.
    pub handshake_timeout_ms: u64,
    /// Minimum wait before a faulted publisher is re-dialed on a topology
    /// pass.
    pub redial_cooldown_ms: u64,
    /// Bind address for the node's data listener (publisher side).
    pub data_bind: SocketAddr,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            dial_timeout_ms: DEFAULT_DIAL_TIMEOUT_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            redial_cooldown_ms: DEFAULT_REDIAL_COOLDOWN_MS,
            data_bind: SocketAddr::from(([0, 0, 0, 0], 0)),
        }
    }
}

impl NodeConfig {
    /// Defaults with `ROSLINK_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = env_usize("ROSLINK_MAX_FRAME_BYTES") {
            config.max_frame_bytes = value;
        }
        if let Some(value) = env_u64("ROSLINK_DIAL_TIMEOUT_MS") {
            config.dial_timeout_ms = value;
        }
        if let Some(value) = env_u64("ROSLINK_HANDSHAKE_TIMEOUT_MS") {
            config.handshake_timeout_ms = value;
        }
        if let Some(value) = env_u64("ROSLINK_REDIAL_COOLDOWN_MS") {
            config.redial_cooldown_ms = value;
        }
        if let Ok(raw) = std::env::var("ROSLINK_DATA_BIND") {
            if let Ok(addr) = raw.parse() {
                config.data_bind = addr;
            }
        }
        config
    }

    /// Load from a JSON file; missing fields fall back to defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, NodeError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|err| NodeError::Config(format!("read config file: {err}")))?;
        serde_json::from_str(&raw).map_err(|err| NodeError::Config(format!("parse config: {err}")))
    }

    pub(crate) fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub(crate) fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub(crate) fn redial_cooldown(&self) -> Duration {
        Duration::from_millis(self.redial_cooldown_ms)
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.parse().ok()
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok()?.parse().ok()
}
