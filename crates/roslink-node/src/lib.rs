//! Topic transport runtime for a publish/subscribe middleware client.
//!
//! # Purpose
//! Implements the per-subscription coordinator that tracks remote publishers,
//! the per-connection workers that handshake and deframe the stream, the
//! node-wide dispatch queue that runs user callbacks, and the symmetric
//! publisher side.
//!
//! # Design notes
//! Every piece of mutable state is owned by exactly one task; tasks talk
//! through channels only. Connection workers never touch subscription state,
//! and user callbacks never run on a task that does socket I/O.
mod config;
mod dispatch;
mod error;
mod node;
mod publication;
mod subscription;

pub use config::NodeConfig;
pub use error::{ConnectionError, NodeError};
pub use node::Node;
pub use publication::Publisher;
pub use subscription::{Callback, Subscriber};

#[cfg(test)]
mod tests;
