// Subscription surface: callbacks, the typed handle, and spawn wiring.
mod coordinator;
mod remote;

use crate::config::{NodeConfig, CONTROL_QUEUE_DEPTH, INBOUND_QUEUE_DEPTH};
use crate::dispatch::JobQueue;
use crate::error::{ConnectionError, NodeError};
use bytes::Bytes;
use roslink_msgs::{Message, MessageEvent};
use roslink_registry::Registry;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub(crate) use remote::{run_remote_publisher, RemoteConnConfig};

/// User callback registered against one subscription.
///
/// The variant is declared at registration time; it decides what the
/// dispatch job hands the callback when a message arrives.
pub enum Callback<M: Message> {
    /// Invoked with no arguments.
    NoArgs(Box<dyn Fn() + Send + Sync>),
    /// Invoked with the decoded message.
    Message(Box<dyn Fn(&M) + Send + Sync>),
    /// Invoked with the decoded message and its delivery envelope.
    MessageAndEvent(Box<dyn Fn(&M, &MessageEvent) + Send + Sync>),
}

impl<M: Message> Callback<M> {
    pub fn no_args(f: impl Fn() + Send + Sync + 'static) -> Self {
        Self::NoArgs(Box::new(f))
    }

    pub fn message(f: impl Fn(&M) + Send + Sync + 'static) -> Self {
        Self::Message(Box::new(f))
    }

    pub fn message_and_event(f: impl Fn(&M, &MessageEvent) + Send + Sync + 'static) -> Self {
        Self::MessageAndEvent(Box::new(f))
    }

    pub(crate) fn invoke(&self, message: &M, event: &MessageEvent) {
        match self {
            Self::NoArgs(f) => f(),
            Self::Message(f) => f(message),
            Self::MessageAndEvent(f) => f(message, event),
        }
    }
}

/// One undecoded payload plus its stamped envelope, as forwarded by a
/// connection worker.
pub(crate) struct InboundMessage {
    pub payload: Bytes,
    pub event: MessageEvent,
}

/// Fatal connection failure reported by a worker.
pub(crate) struct Disconnect {
    pub uri: String,
    pub error: ConnectionError,
}

/// Handle to one live subscription.
///
/// Cheap to clone; dropping every handle does not end the subscription (the
/// node keeps it alive until `shutdown`).
#[derive(Debug)]
pub struct Subscriber<M: Message> {
    topic: String,
    callback_tx: mpsc::Sender<Callback<M>>,
    shutdown_tx: mpsc::Sender<()>,
    publisher_count: Arc<AtomicUsize>,
}

impl<M: Message> Clone for Subscriber<M> {
    fn clone(&self) -> Self {
        Self {
            topic: self.topic.clone(),
            callback_tx: self.callback_tx.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
            publisher_count: Arc::clone(&self.publisher_count),
        }
    }
}

impl<M: Message> Subscriber<M> {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Append one more callback. Existing connections are unaffected, and
    /// the new callback only sees payloads that arrive after the append is
    /// processed.
    pub async fn add_callback(&self, callback: Callback<M>) -> Result<(), NodeError> {
        self.callback_tx
            .send(callback)
            .await
            .map_err(|_| NodeError::ShutDown)
    }

    /// Number of publishers in the last processed topology update.
    pub fn num_publishers(&self) -> usize {
        self.publisher_count
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Request subscription shutdown. Best-effort; the coordinator tears
    /// down its connections and unregisters from the registry.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// Channel ends the node runtime keeps per subscription, type-erased so one
/// map can hold every topic.
pub(crate) struct SubscriptionEndpoints {
    pub topology_tx: mpsc::Sender<Vec<String>>,
    pub shutdown_tx: mpsc::Sender<()>,
    /// `mpsc::Sender<Callback<M>>` behind `Any`; downcast on repeat
    /// subscribes to the same topic.
    pub callback_tx_any: Box<dyn Any + Send + Sync>,
    pub publisher_count: Arc<AtomicUsize>,
    pub type_name: &'static str,
    pub task: JoinHandle<()>,
}

impl SubscriptionEndpoints {
    /// Rebuild a typed handle, if `M` matches the subscription's type.
    pub(crate) fn handle<M: Message>(&self, topic: &str) -> Option<Subscriber<M>> {
        let callback_tx = self
            .callback_tx_any
            .downcast_ref::<mpsc::Sender<Callback<M>>>()?;
        Some(Subscriber {
            topic: topic.to_string(),
            callback_tx: callback_tx.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
            publisher_count: Arc::clone(&self.publisher_count),
        })
    }
}

pub(crate) struct SpawnConfig<M: Message> {
    pub topic: String,
    pub caller_id: String,
    pub api_uri: String,
    pub registry: Arc<dyn Registry>,
    pub config: NodeConfig,
    pub dispatch: JobQueue,
    pub callback: Callback<M>,
}

/// Create the coordinator task for one subscription and hand back its typed
/// handle plus the endpoints the node retains.
pub(crate) fn spawn<M: Message>(spawn_config: SpawnConfig<M>) -> (Subscriber<M>, SubscriptionEndpoints) {
    let (topology_tx, topology_rx) = mpsc::channel(CONTROL_QUEUE_DEPTH);
    let (callback_tx, callback_rx) = mpsc::channel(CONTROL_QUEUE_DEPTH);
    let (shutdown_tx, shutdown_rx) = mpsc::channel(CONTROL_QUEUE_DEPTH);
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
    let (disconnect_tx, disconnect_rx) = mpsc::channel(CONTROL_QUEUE_DEPTH);
    let publisher_count = Arc::new(AtomicUsize::new(0));

    let coordinator = coordinator::Coordinator::<M> {
        topic: spawn_config.topic.clone(),
        caller_id: spawn_config.caller_id,
        api_uri: spawn_config.api_uri,
        registry: spawn_config.registry,
        config: spawn_config.config,
        dispatch: spawn_config.dispatch,
        pub_list: Vec::new(),
        connections: HashMap::new(),
        callbacks: vec![Arc::new(spawn_config.callback)],
        retry_after: HashMap::new(),
        incompatible: std::collections::HashSet::new(),
        publisher_count: Arc::clone(&publisher_count),
        inbound_tx,
        disconnect_tx,
    };
    let task = tokio::spawn(coordinator::run_subscription(
        coordinator,
        topology_rx,
        callback_rx,
        inbound_rx,
        disconnect_rx,
        shutdown_rx,
    ));

    let subscriber = Subscriber {
        topic: spawn_config.topic,
        callback_tx: callback_tx.clone(),
        shutdown_tx: shutdown_tx.clone(),
        publisher_count: Arc::clone(&publisher_count),
    };
    let endpoints = SubscriptionEndpoints {
        topology_tx,
        shutdown_tx,
        callback_tx_any: Box::new(callback_tx),
        publisher_count,
        type_name: M::type_name(),
        task,
    };
    (subscriber, endpoints)
}
