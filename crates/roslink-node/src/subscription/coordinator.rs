// Per-subscription event loop.
//
// All mutable subscription state lives here and is touched only from this
// loop; everything else talks to it through channels. That single-owner
// discipline is what keeps the transport race-free.
use crate::config::NodeConfig;
use crate::dispatch::JobQueue;
use crate::subscription::{Callback, Disconnect, InboundMessage, RemoteConnConfig};
use roslink_msgs::Message;
use roslink_registry::{Registry, TCPROS};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

pub(crate) struct Coordinator<M: Message> {
    pub topic: String,
    pub caller_id: String,
    pub api_uri: String,
    pub registry: Arc<dyn Registry>,
    pub config: NodeConfig,
    pub dispatch: JobQueue,
    /// Last authoritative publisher list, for diagnostics.
    pub pub_list: Vec<String>,
    /// Publisher API URI → cancellation handle for the live worker.
    pub connections: HashMap<String, ConnectionHandle>,
    pub callbacks: Vec<Arc<Callback<M>>>,
    /// Faulted publishers and when they become eligible for re-dial.
    pub retry_after: HashMap<String, Instant>,
    /// Publishers rejected for a type mismatch; never re-dialed while they
    /// stay in the topology.
    pub incompatible: HashSet<String>,
    pub publisher_count: Arc<std::sync::atomic::AtomicUsize>,
    pub inbound_tx: mpsc::Sender<InboundMessage>,
    pub disconnect_tx: mpsc::Sender<Disconnect>,
}

pub(crate) struct ConnectionHandle {
    quit_tx: mpsc::Sender<()>,
}

pub(crate) async fn run_subscription<M: Message>(
    mut coordinator: Coordinator<M>,
    mut topology_rx: mpsc::Receiver<Vec<String>>,
    mut callback_rx: mpsc::Receiver<Callback<M>>,
    mut inbound_rx: mpsc::Receiver<InboundMessage>,
    mut disconnect_rx: mpsc::Receiver<Disconnect>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    debug!(topic = %coordinator.topic, "subscription loop started");
    loop {
        tokio::select! {
            Some(list) = topology_rx.recv() => coordinator.handle_topology(list).await,
            Some(callback) = callback_rx.recv() => coordinator.callbacks.push(Arc::new(callback)),
            Some(inbound) = inbound_rx.recv() => coordinator.handle_inbound(inbound).await,
            Some(notice) = disconnect_rx.recv() => coordinator.handle_disconnect(notice),
            // None here means every handle is gone; treat it like shutdown.
            _ = shutdown_rx.recv() => {
                coordinator.shutdown().await;
                break;
            }
        }
    }
    debug!(topic = %coordinator.topic, "subscription loop exited");
}

impl<M: Message> Coordinator<M> {
    async fn handle_topology(&mut self, list: Vec<String>) {
        debug!(topic = %self.topic, publishers = list.len(), "topology update");
        self.publisher_count.store(list.len(), Ordering::Relaxed);
        metrics::gauge!("roslink_sub_publishers", "topic" => self.topic.clone())
            .set(list.len() as f64);

        // Failure records for publishers that left the topology are stale.
        self.retry_after.retain(|uri, _| list.contains(uri));
        self.incompatible.retain(|uri| list.contains(uri));

        let dead: Vec<String> = self
            .connections
            .keys()
            .filter(|uri| !list.contains(*uri))
            .cloned()
            .collect();
        for uri in dead {
            if let Some(handle) = self.connections.remove(&uri) {
                let _ = handle.quit_tx.try_send(());
            }
            debug!(topic = %self.topic, publisher = %uri, "publisher left topology");
        }

        for uri in &list {
            if self.connections.contains_key(uri) || self.incompatible.contains(uri) {
                continue;
            }
            if let Some(at) = self.retry_after.get(uri) {
                if Instant::now() < *at {
                    continue;
                }
                self.retry_after.remove(uri);
            }
            self.connect_publisher(uri).await;
        }
        self.pub_list = list;
    }

    // Negotiate transport parameters and spawn the connection worker. A
    // per-publisher failure is logged and skipped; it must not fail the rest
    // of the update.
    async fn connect_publisher(&mut self, uri: &str) {
        let params = match self
            .registry
            .request_topic(uri, &self.caller_id, &self.topic, &[TCPROS])
            .await
        {
            Ok(params) => params,
            Err(err) => {
                warn!(topic = %self.topic, publisher = %uri, error = %err,
                    "failed to negotiate transport");
                return;
            }
        };
        if params.protocol != TCPROS {
            warn!(topic = %self.topic, publisher = %uri, protocol = %params.protocol,
                "publisher offered an unsupported protocol");
            return;
        }
        let (quit_tx, quit_rx) = mpsc::channel(1);
        self.connections
            .insert(uri.to_string(), ConnectionHandle { quit_tx });
        tokio::spawn(crate::subscription::run_remote_publisher(
            RemoteConnConfig {
                uri: uri.to_string(),
                addr: format!("{}:{}", params.host, params.port),
                topic: self.topic.clone(),
                type_name: M::type_name(),
                md5sum: M::md5sum(),
                caller_id: self.caller_id.clone(),
                max_frame_bytes: self.config.max_frame_bytes,
                dial_timeout: self.config.dial_timeout(),
                handshake_timeout: self.config.handshake_timeout(),
                inbound_tx: self.inbound_tx.clone(),
                quit_rx,
                disconnect_tx: self.disconnect_tx.clone(),
            },
        ));
    }

    async fn handle_inbound(&mut self, inbound: InboundMessage) {
        metrics::counter!("roslink_sub_messages_total", "topic" => self.topic.clone())
            .increment(1);
        // Snapshot the callback list: a callback added later must not run
        // against this payload, and the list must not mutate under the job.
        let callbacks = self.callbacks.clone();
        let topic = self.topic.clone();
        let accepted = self
            .dispatch
            .push(Box::new(move || {
                let mut payload = inbound.payload;
                match M::decode(&mut payload) {
                    Ok(message) => {
                        for callback in &callbacks {
                            callback.invoke(&message, &inbound.event);
                        }
                    }
                    Err(err) => {
                        error!(topic = %topic, error = %err, "failed to decode message payload");
                    }
                }
            }))
            .await;
        if !accepted {
            warn!(topic = %self.topic, "dispatch queue closed; dropping message");
        }
    }

    fn handle_disconnect(&mut self, notice: Disconnect) {
        warn!(topic = %self.topic, publisher = %notice.uri, error = %notice.error,
            "publisher connection lost");
        self.connections.remove(&notice.uri);
        if notice.error.retryable() {
            self.retry_after.insert(
                notice.uri,
                Instant::now() + self.config.redial_cooldown(),
            );
        } else {
            self.incompatible.insert(notice.uri);
        }
    }

    async fn shutdown(&mut self) {
        debug!(topic = %self.topic, "shutting down subscription");
        for (_, handle) in self.connections.drain() {
            let _ = handle.quit_tx.try_send(());
        }
        if let Err(err) = self
            .registry
            .unregister_subscriber(&self.caller_id, &self.topic, &self.api_uri)
            .await
        {
            warn!(topic = %self.topic, error = %err, "failed to unregister subscriber");
        }
    }
}
