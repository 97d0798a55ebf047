// Publisher side: the node's data listener and per-topic fan-out workers.
//
// One TCP listener per node accepts subscriber connections; each handshake
// resolves the topic and hands the socket's write half to that topic's
// publication worker. The worker multiplexes new subscribers, outgoing
// publishes, and shutdown, exactly like the subscription side's fan-in loop.
use crate::config::{NodeConfig, CONTROL_QUEUE_DEPTH, PUBLISH_QUEUE_DEPTH, SUBSCRIBER_LINK_QUEUE_DEPTH};
use crate::error::NodeError;
use bytes::{Bytes, BytesMut};
use roslink_msgs::Message;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Handle for publishing to one advertised topic.
pub struct Publisher<M: Message> {
    topic: String,
    publish_tx: mpsc::Sender<Bytes>,
    _marker: PhantomData<fn() -> M>,
}

impl<M: Message> Clone for Publisher<M> {
    fn clone(&self) -> Self {
        Self {
            topic: self.topic.clone(),
            publish_tx: self.publish_tx.clone(),
            _marker: PhantomData,
        }
    }
}

impl<M: Message> Publisher<M> {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Encode and fan out one message to every connected subscriber.
    pub async fn publish(&self, message: &M) -> Result<(), NodeError> {
        let mut buf = BytesMut::new();
        message.encode(&mut buf);
        self.publish_tx
            .send(buf.freeze())
            .await
            .map_err(|_| NodeError::ShutDown)
    }
}

pub(crate) fn publisher_handle<M: Message>(topic: &str, publish_tx: mpsc::Sender<Bytes>) -> Publisher<M> {
    Publisher {
        topic: topic.to_string(),
        publish_tx,
        _marker: PhantomData,
    }
}

/// One connected subscriber. The read half is discarded after the
/// handshake; subscribers never send again on this socket.
pub(crate) struct SubscriberLink {
    caller_id: String,
    stream: OwnedWriteHalf,
}

/// Accept-loop routing entry for one advertised topic.
#[derive(Clone)]
pub(crate) struct PublicationRoute {
    pub conn_tx: mpsc::Sender<SubscriberLink>,
    pub type_name: String,
    pub md5sum: String,
}

/// Channel ends the node runtime keeps per publication.
pub(crate) struct PublicationEndpoints {
    pub publish_tx: mpsc::Sender<Bytes>,
    pub shutdown_tx: mpsc::Sender<()>,
    pub type_name: &'static str,
    pub task: JoinHandle<()>,
}

pub(crate) fn spawn<M: Message>(
    topic: String,
) -> (Publisher<M>, PublicationEndpoints, PublicationRoute) {
    let (publish_tx, publish_rx) = mpsc::channel(PUBLISH_QUEUE_DEPTH);
    let (conn_tx, conn_rx) = mpsc::channel(SUBSCRIBER_LINK_QUEUE_DEPTH);
    let (shutdown_tx, shutdown_rx) = mpsc::channel(CONTROL_QUEUE_DEPTH);
    let task = tokio::spawn(run_publication(topic.clone(), conn_rx, publish_rx, shutdown_rx));
    let publisher = publisher_handle(&topic, publish_tx.clone());
    let endpoints = PublicationEndpoints {
        publish_tx,
        shutdown_tx,
        type_name: M::type_name(),
        task,
    };
    let route = PublicationRoute {
        conn_tx,
        type_name: M::type_name().to_string(),
        md5sum: M::md5sum().to_string(),
    };
    (publisher, endpoints, route)
}

async fn run_publication(
    topic: String,
    mut conn_rx: mpsc::Receiver<SubscriberLink>,
    mut publish_rx: mpsc::Receiver<Bytes>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    debug!(topic = %topic, "publication loop started");
    let mut subscribers: Vec<SubscriberLink> = Vec::new();
    loop {
        tokio::select! {
            Some(link) = conn_rx.recv() => {
                info!(topic = %topic, subscriber = %link.caller_id, "subscriber connected");
                subscribers.push(link);
            }
            Some(payload) = publish_rx.recv() => {
                let mut kept = Vec::with_capacity(subscribers.len());
                for mut link in subscribers.drain(..) {
                    match roslink_wire::write_frame(&mut link.stream, &payload).await {
                        Ok(()) => kept.push(link),
                        Err(err) => {
                            warn!(topic = %topic, subscriber = %link.caller_id, error = %err,
                                "dropping subscriber after write failure");
                        }
                    }
                }
                subscribers = kept;
                metrics::counter!("roslink_pub_messages_total", "topic" => topic.clone())
                    .increment(1);
            }
            _ = shutdown_rx.recv() => break,
        }
    }
    // Dropping the write halves closes the sockets; subscribers observe a
    // clean end of stream.
    debug!(topic = %topic, "publication loop exited");
}

pub(crate) async fn run_accept_loop(
    listener: TcpListener,
    routes: Arc<Mutex<HashMap<String, PublicationRoute>>>,
    caller_id: String,
    config: NodeConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        continue;
                    }
                };
                let routes = Arc::clone(&routes);
                let caller_id = caller_id.clone();
                let config = config.clone();
                tokio::spawn(async move {
                    if let Err(err) =
                        handshake_subscriber(stream, routes, caller_id, config).await
                    {
                        debug!(peer = %peer, error = %err, "subscriber handshake failed");
                    }
                });
            }
        }
    }
    debug!("accept loop exited");
}

// Read the subscriber's header, validate it against the advertised topic,
// answer, and hand the socket to the publication worker. Refusals are
// answered with an `error` header field and a close, per the wire protocol.
async fn handshake_subscriber(
    mut stream: TcpStream,
    routes: Arc<Mutex<HashMap<String, PublicationRoute>>>,
    caller_id: String,
    config: NodeConfig,
) -> Result<(), roslink_wire::Error> {
    let _ = stream.set_nodelay(true);
    let fields = tokio::time::timeout(
        config.handshake_timeout(),
        roslink_wire::read_header(&mut stream, config.max_frame_bytes),
    )
    .await
    .map_err(|_| {
        roslink_wire::Error::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "handshake timed out",
        ))
    })??;
    let header: HashMap<String, String> = fields.into_iter().collect();

    let Some(topic) = header.get("topic") else {
        roslink_wire::write_header(&mut stream, &[("error", "missing topic field")]).await?;
        return Ok(());
    };
    let route = routes.lock().await.get(topic).cloned();
    let Some(route) = route else {
        let reason = format!("no publication for topic {topic}");
        roslink_wire::write_header(&mut stream, &[("error", reason.as_str())]).await?;
        return Ok(());
    };
    let type_matches = header.get("type").is_some_and(|t| *t == route.type_name);
    let md5sum_matches = header.get("md5sum").is_some_and(|m| *m == route.md5sum);
    if !type_matches || !md5sum_matches {
        warn!(topic = %topic, subscriber = ?header.get("callerid"),
            "rejecting subscriber with incompatible type");
        let reason = format!("type mismatch for topic {topic}");
        roslink_wire::write_header(&mut stream, &[("error", reason.as_str())]).await?;
        return Ok(());
    }

    let reply = [
        ("md5sum", route.md5sum.as_str()),
        ("type", route.type_name.as_str()),
        ("callerid", caller_id.as_str()),
    ];
    roslink_wire::write_header(&mut stream, &reply).await?;

    let subscriber_id = header.get("callerid").cloned().unwrap_or_default();
    let (_read_half, write_half) = stream.into_split();
    let _ = route
        .conn_tx
        .send(SubscriberLink {
            caller_id: subscriber_id,
            stream: write_half,
        })
        .await;
    Ok(())
}
