// Node runtime: identity, registry handle, topic maps, dispatch drain loop.
use crate::config::{NodeConfig, DISPATCH_QUEUE_DEPTH};
use crate::dispatch::{self, Job, JobQueue};
use crate::error::NodeError;
use crate::publication::{self, PublicationEndpoints, PublicationRoute, Publisher};
use crate::subscription::{self, Callback, Subscriber, SubscriptionEndpoints};
use roslink_msgs::Message;
use roslink_registry::{Registry, TopologyUpdate};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One participating process: owns subscriptions, publications, the registry
/// handle, and the dispatch queue.
///
/// The registry handle is passed in explicitly at construction; there is no
/// process-wide directory state.
pub struct Node {
    caller_id: String,
    api_uri: String,
    registry: Arc<dyn Registry>,
    config: NodeConfig,
    dispatch: JobQueue,
    dispatch_rx: std::sync::Mutex<Option<mpsc::Receiver<Job>>>,
    subscriptions: Mutex<HashMap<String, SubscriptionEndpoints>>,
    publications: Mutex<HashMap<String, PublicationEndpoints>>,
    routes: Arc<Mutex<HashMap<String, PublicationRoute>>>,
    listener: Mutex<Option<ListenerState>>,
    shutdown: watch::Sender<bool>,
}

struct ListenerState {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl Node {
    pub fn new(name: &str, registry: Arc<dyn Registry>, config: NodeConfig) -> Self {
        let (dispatch, dispatch_rx) = dispatch::job_queue(DISPATCH_QUEUE_DEPTH);
        let (shutdown, _) = watch::channel(false);
        Self {
            caller_id: name.to_string(),
            api_uri: format!("node://{}", name.trim_start_matches('/')),
            registry,
            config,
            dispatch,
            dispatch_rx: std::sync::Mutex::new(Some(dispatch_rx)),
            subscriptions: Mutex::new(HashMap::new()),
            publications: Mutex::new(HashMap::new()),
            routes: Arc::new(Mutex::new(HashMap::new())),
            listener: Mutex::new(None),
            shutdown,
        }
    }

    pub fn caller_id(&self) -> &str {
        &self.caller_id
    }

    /// The node API URI this node registers under.
    pub fn api_uri(&self) -> &str {
        &self.api_uri
    }

    /// Create or extend a subscription.
    ///
    /// The first call for a topic registers with the registry (failures
    /// surface here) and starts the coordinator; later calls with the same
    /// message type append the callback to the live subscription.
    pub async fn subscribe<M: Message>(
        &self,
        topic: &str,
        callback: Callback<M>,
    ) -> Result<Subscriber<M>, NodeError> {
        if *self.shutdown.borrow() {
            return Err(NodeError::ShutDown);
        }
        let mut subscriptions = self.subscriptions.lock().await;
        if let Some(existing) = subscriptions.get(topic) {
            let Some(handle) = existing.handle::<M>(topic) else {
                return Err(NodeError::TypeConflict {
                    topic: topic.to_string(),
                    existing: existing.type_name.to_string(),
                });
            };
            handle.add_callback(callback).await?;
            return Ok(handle);
        }

        let initial = self
            .registry
            .register_subscriber(&self.caller_id, topic, M::type_name(), &self.api_uri)
            .await?;
        let (subscriber, endpoints) = subscription::spawn(subscription::SpawnConfig {
            topic: topic.to_string(),
            caller_id: self.caller_id.clone(),
            api_uri: self.api_uri.clone(),
            registry: Arc::clone(&self.registry),
            config: self.config.clone(),
            dispatch: self.dispatch.clone(),
            callback,
        });
        let _ = endpoints.topology_tx.send(initial).await;
        subscriptions.insert(topic.to_string(), endpoints);
        info!(node = %self.caller_id, topic = %topic, "subscribed");
        Ok(subscriber)
    }

    /// Advertise a topic and get a publish handle.
    pub async fn advertise<M: Message>(&self, topic: &str) -> Result<Publisher<M>, NodeError> {
        if *self.shutdown.borrow() {
            return Err(NodeError::ShutDown);
        }
        let mut publications = self.publications.lock().await;
        if let Some(existing) = publications.get(topic) {
            if existing.type_name != M::type_name() {
                return Err(NodeError::TypeConflict {
                    topic: topic.to_string(),
                    existing: existing.type_name.to_string(),
                });
            }
            return Ok(publication::publisher_handle(topic, existing.publish_tx.clone()));
        }

        self.bind_data_listener().await?;
        self.registry
            .register_publisher(&self.caller_id, topic, M::type_name(), &self.api_uri)
            .await?;
        let (publisher, endpoints, route) = publication::spawn::<M>(topic.to_string());
        self.routes.lock().await.insert(topic.to_string(), route);
        publications.insert(topic.to_string(), endpoints);
        info!(node = %self.caller_id, topic = %topic, "advertised");
        Ok(publisher)
    }

    /// Bind the node's data listener if it is not up yet, and return its
    /// address. `advertise` does this implicitly; callers that must know the
    /// address before the first advertise can do it explicitly.
    pub async fn bind_data_listener(&self) -> Result<SocketAddr, NodeError> {
        let mut guard = self.listener.lock().await;
        if let Some(state) = guard.as_ref() {
            return Ok(state.addr);
        }
        let listener = TcpListener::bind(self.config.data_bind).await?;
        let addr = listener.local_addr()?;
        info!(node = %self.caller_id, addr = %addr, "data listener started");
        let task = tokio::spawn(publication::run_accept_loop(
            listener,
            Arc::clone(&self.routes),
            self.caller_id.clone(),
            self.config.clone(),
            self.shutdown.subscribe(),
        ));
        *guard = Some(ListenerState { addr, task });
        Ok(addr)
    }

    /// Address of the data listener, if it has been bound.
    pub async fn data_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().await.as_ref().map(|state| state.addr)
    }

    /// Deliver an authoritative publisher list for one topic to its
    /// coordinator. This is the push path the registry layer feeds.
    pub async fn publisher_update(&self, topic: &str, publishers: Vec<String>) {
        let topology_tx = {
            let subscriptions = self.subscriptions.lock().await;
            subscriptions
                .get(topic)
                .map(|endpoints| endpoints.topology_tx.clone())
        };
        match topology_tx {
            Some(tx) => {
                let _ = tx.send(publishers).await;
            }
            None => debug!(topic = %topic, "topology update for unknown topic"),
        }
    }

    /// Forward a registry update stream into `publisher_update` until the
    /// stream closes.
    pub fn drive_topology_updates(
        self: &Arc<Self>,
        mut updates: mpsc::UnboundedReceiver<TopologyUpdate>,
    ) -> JoinHandle<()> {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(update) = updates.recv().await {
                node.publisher_update(&update.topic, update.publishers).await;
            }
        })
    }

    /// Drain the dispatch queue until shutdown. This is the only place user
    /// callbacks execute.
    pub async fn spin(&self) {
        let receiver = self.dispatch_rx.lock().unwrap().take();
        let Some(mut receiver) = receiver else {
            warn!(node = %self.caller_id, "spin called more than once");
            return;
        };
        let mut shutdown = self.shutdown.subscribe();
        debug!(node = %self.caller_id, "dispatch loop started");
        loop {
            tokio::select! {
                job = receiver.recv() => match job {
                    Some(job) => job(),
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(node = %self.caller_id, "dispatch loop exited");
    }

    /// Shut the node down: signal every subscription, publication, and the
    /// accept loop, unregister publications, then await the child tasks.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let mut tasks = Vec::new();
        {
            let mut subscriptions = self.subscriptions.lock().await;
            for (_, endpoints) in subscriptions.drain() {
                let _ = endpoints.shutdown_tx.try_send(());
                tasks.push(endpoints.task);
            }
        }
        {
            let mut publications = self.publications.lock().await;
            for (topic, endpoints) in publications.drain() {
                let _ = endpoints.shutdown_tx.try_send(());
                tasks.push(endpoints.task);
                if let Err(err) = self
                    .registry
                    .unregister_publisher(&self.caller_id, &topic, &self.api_uri)
                    .await
                {
                    warn!(node = %self.caller_id, topic = %topic, error = %err,
                        "failed to unregister publisher");
                }
            }
        }
        self.routes.lock().await.clear();
        if let Some(state) = self.listener.lock().await.take() {
            tasks.push(state.task);
        }
        for task in tasks {
            let _ = task.await;
        }
        info!(node = %self.caller_id, "node shut down");
    }
}
