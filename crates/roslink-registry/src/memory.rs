// In-process registry used by tests and demos.
use crate::{ProtocolParams, Registry, RegistryError, Result, TopologyUpdate, TCPROS};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::{mpsc, Mutex};

/// In-memory implementation of the registry contract.
///
/// Keeps publisher/subscriber bookkeeping per topic and pushes a
/// `TopologyUpdate` to every attached subscriber node whenever a topic's
/// publisher set changes. `request_topic` is answered from a node API URI →
/// data address map populated via `set_data_addr`; in a networked deployment
/// that negotiation would be an RPC to the publisher node itself.
#[derive(Default)]
pub struct InMemoryRegistry {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    topics: HashMap<String, TopicRecord>,
    nodes: HashMap<String, NodeRecord>,
}

#[derive(Default)]
struct TopicRecord {
    /// Publisher node API URI → declared type name.
    publishers: HashMap<String, String>,
    /// Subscriber node API URIs.
    subscribers: Vec<String>,
}

#[derive(Default)]
struct NodeRecord {
    data_addr: Option<SocketAddr>,
    updates: Option<mpsc::UnboundedSender<TopologyUpdate>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the topology-update stream for a node. Updates for every topic
    /// the node subscribes to are pushed here; the caller forwards them into
    /// the node runtime.
    pub async fn attach_node(&self, api_uri: &str) -> mpsc::UnboundedReceiver<TopologyUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().await;
        state.nodes.entry(api_uri.to_string()).or_default().updates = Some(tx);
        rx
    }

    /// Record where a node's data listener lives, for `request_topic`.
    pub async fn set_data_addr(&self, api_uri: &str, addr: SocketAddr) {
        let mut state = self.state.lock().await;
        state.nodes.entry(api_uri.to_string()).or_default().data_addr = Some(addr);
    }
}

impl State {
    // Push the current publisher list for `topic` to every subscribed node.
    fn notify_subscribers(&mut self, topic: &str) {
        let Some(record) = self.topics.get(topic) else {
            return;
        };
        let publishers: Vec<String> = record.publishers.keys().cloned().collect();
        for subscriber in &record.subscribers {
            let Some(node) = self.nodes.get(subscriber) else {
                continue;
            };
            if let Some(updates) = &node.updates {
                let _ = updates.send(TopologyUpdate {
                    topic: topic.to_string(),
                    publishers: publishers.clone(),
                });
            }
        }
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn register_subscriber(
        &self,
        _caller_id: &str,
        topic: &str,
        _type_name: &str,
        api_uri: &str,
    ) -> Result<Vec<String>> {
        let mut state = self.state.lock().await;
        let record = state.topics.entry(topic.to_string()).or_default();
        if !record.subscribers.iter().any(|uri| uri == api_uri) {
            record.subscribers.push(api_uri.to_string());
        }
        Ok(record.publishers.keys().cloned().collect())
    }

    async fn unregister_subscriber(
        &self,
        _caller_id: &str,
        topic: &str,
        api_uri: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(record) = state.topics.get_mut(topic) {
            record.subscribers.retain(|uri| uri != api_uri);
        }
        Ok(())
    }

    async fn register_publisher(
        &self,
        _caller_id: &str,
        topic: &str,
        type_name: &str,
        api_uri: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let record = state.topics.entry(topic.to_string()).or_default();
        record
            .publishers
            .insert(api_uri.to_string(), type_name.to_string());
        state.notify_subscribers(topic);
        Ok(())
    }

    async fn unregister_publisher(
        &self,
        _caller_id: &str,
        topic: &str,
        api_uri: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let removed = state
            .topics
            .get_mut(topic)
            .is_some_and(|record| record.publishers.remove(api_uri).is_some());
        if removed {
            state.notify_subscribers(topic);
        }
        Ok(())
    }

    async fn request_topic(
        &self,
        publisher_api_uri: &str,
        _caller_id: &str,
        _topic: &str,
        protocols: &[&str],
    ) -> Result<ProtocolParams> {
        if !protocols.contains(&TCPROS) {
            return Err(RegistryError::Rejected(format!(
                "no supported protocol in {protocols:?}"
            )));
        }
        let state = self.state.lock().await;
        let addr = state
            .nodes
            .get(publisher_api_uri)
            .and_then(|node| node.data_addr)
            .ok_or_else(|| {
                RegistryError::Rejected(format!("unknown publisher {publisher_api_uri}"))
            })?;
        Ok(ProtocolParams {
            protocol: TCPROS.to_string(),
            host: addr.ip().to_string(),
            port: addr.port(),
        })
    }
}
