use crate::config::NodeConfig;
use crate::dispatch;
use crate::error::ConnectionError;
use crate::subscription::{
    self, run_remote_publisher, Callback, Disconnect, InboundMessage, RemoteConnConfig,
    SpawnConfig,
};
use async_trait::async_trait;
use roslink_msgs::std_msgs::Int32;
use roslink_msgs::Message;
use roslink_registry::{ProtocolParams, Registry, RegistryError, TCPROS};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const TEST_TOPIC: &str = "/test_topic";
const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(300);

// Registry double answering request_topic from a fixed uri -> addr map.
struct StaticRegistry {
    addrs: HashMap<String, SocketAddr>,
}

impl StaticRegistry {
    fn single(uri: &str, addr: SocketAddr) -> Arc<Self> {
        let mut addrs = HashMap::new();
        addrs.insert(uri.to_string(), addr);
        Arc::new(Self { addrs })
    }
}

#[async_trait]
impl Registry for StaticRegistry {
    async fn register_subscriber(
        &self,
        _caller_id: &str,
        _topic: &str,
        _type_name: &str,
        _api_uri: &str,
    ) -> roslink_registry::Result<Vec<String>> {
        Ok(self.addrs.keys().cloned().collect())
    }

    async fn unregister_subscriber(
        &self,
        _caller_id: &str,
        _topic: &str,
        _api_uri: &str,
    ) -> roslink_registry::Result<()> {
        Ok(())
    }

    async fn register_publisher(
        &self,
        _caller_id: &str,
        _topic: &str,
        _type_name: &str,
        _api_uri: &str,
    ) -> roslink_registry::Result<()> {
        Ok(())
    }

    async fn unregister_publisher(
        &self,
        _caller_id: &str,
        _topic: &str,
        _api_uri: &str,
    ) -> roslink_registry::Result<()> {
        Ok(())
    }

    async fn request_topic(
        &self,
        publisher_api_uri: &str,
        _caller_id: &str,
        _topic: &str,
        _protocols: &[&str],
    ) -> roslink_registry::Result<ProtocolParams> {
        let addr = self
            .addrs
            .get(publisher_api_uri)
            .ok_or_else(|| RegistryError::Rejected("unknown publisher".into()))?;
        Ok(ProtocolParams {
            protocol: TCPROS.to_string(),
            host: addr.ip().to_string(),
            port: addr.port(),
        })
    }
}

async fn fake_publisher<F, Fut>(on_conn: F) -> (SocketAddr, JoinHandle<()>)
where
    F: FnOnce(TcpStream) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        on_conn(stream).await;
    });
    (addr, task)
}

// Read the subscriber's header and answer with the given identity.
async fn answer_handshake(stream: &mut TcpStream, type_name: &str, md5sum: &str, caller_id: &str) {
    roslink_wire::read_header(stream, 1 << 20)
        .await
        .expect("request header");
    roslink_wire::write_header(
        stream,
        &[
            ("md5sum", md5sum),
            ("type", type_name),
            ("callerid", caller_id),
        ],
    )
    .await
    .expect("response header");
}

struct WorkerHarness {
    inbound_rx: mpsc::Receiver<InboundMessage>,
    quit_tx: mpsc::Sender<()>,
    disconnect_rx: mpsc::Receiver<Disconnect>,
    task: JoinHandle<()>,
}

fn spawn_worker(addr: SocketAddr) -> WorkerHarness {
    let (inbound_tx, inbound_rx) = mpsc::channel(16);
    let (quit_tx, quit_rx) = mpsc::channel(1);
    let (disconnect_tx, disconnect_rx) = mpsc::channel(16);
    let task = tokio::spawn(run_remote_publisher(RemoteConnConfig {
        uri: "node://pub".to_string(),
        addr: addr.to_string(),
        topic: TEST_TOPIC.to_string(),
        type_name: Int32::type_name(),
        md5sum: Int32::md5sum(),
        caller_id: "/sub".to_string(),
        max_frame_bytes: 1 << 20,
        dial_timeout: Duration::from_secs(1),
        handshake_timeout: Duration::from_secs(1),
        inbound_tx,
        quit_rx,
        disconnect_tx,
    }));
    WorkerHarness {
        inbound_rx,
        quit_tx,
        disconnect_rx,
        task,
    }
}

#[tokio::test]
async fn worker_rejects_mismatched_md5sum() {
    let (addr, pub_task) = fake_publisher(|mut stream| async move {
        answer_handshake(
            &mut stream,
            Int32::type_name(),
            "0000000000000000000000000000dead",
            "/talker",
        )
        .await;
    })
    .await;
    let mut harness = spawn_worker(addr);

    let notice = timeout(WAIT, harness.disconnect_rx.recv())
        .await
        .expect("no disconnect notice")
        .expect("channel open");
    assert!(matches!(
        notice.error,
        ConnectionError::IncompatibleType { .. }
    ));
    assert_eq!(notice.uri, "node://pub");
    // The read loop was never entered.
    timeout(WAIT, harness.task).await.expect("worker exit").ok();
    assert!(harness.inbound_rx.try_recv().is_err());
    pub_task.await.expect("publisher");
}

#[tokio::test]
async fn worker_reports_dial_failure() {
    // Nothing is listening on this address once the listener is dropped.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let mut harness = spawn_worker(addr);
    let notice = timeout(WAIT, harness.disconnect_rx.recv())
        .await
        .expect("no disconnect notice")
        .expect("channel open");
    assert!(matches!(notice.error, ConnectionError::DialFailed(_)));
}

#[tokio::test]
async fn cancellation_is_quiet() {
    let (ready_tx, ready_rx) = oneshot::channel();
    let (addr, pub_task) = fake_publisher(|mut stream| async move {
        answer_handshake(&mut stream, Int32::type_name(), Int32::md5sum(), "/talker").await;
        let _ = ready_tx.send(());
        // Hold the socket open until the worker hangs up.
        let mut buf = [0u8; 16];
        while stream.read(&mut buf).await.unwrap_or(0) != 0 {}
    })
    .await;
    let mut harness = spawn_worker(addr);
    ready_rx.await.expect("handshake done");

    harness.quit_tx.send(()).await.expect("quit");
    timeout(WAIT, harness.task)
        .await
        .expect("worker did not unblock")
        .expect("worker task");
    // Quiet shutdown: the notice channel closes without a notice.
    assert!(harness.disconnect_rx.recv().await.is_none());
    timeout(WAIT, pub_task).await.expect("publisher").ok();
}

#[tokio::test]
async fn clean_eof_is_quiet() {
    let (addr, pub_task) = fake_publisher(|mut stream| async move {
        answer_handshake(&mut stream, Int32::type_name(), Int32::md5sum(), "/talker").await;
        // Close at a frame boundary.
    })
    .await;
    let mut harness = spawn_worker(addr);
    timeout(WAIT, harness.task)
        .await
        .expect("worker exit")
        .expect("worker task");
    assert!(harness.disconnect_rx.recv().await.is_none());
    pub_task.await.expect("publisher");
}

#[tokio::test]
async fn truncated_frame_reports_exactly_one_disconnect() {
    let (addr, pub_task) = fake_publisher(|mut stream| async move {
        answer_handshake(&mut stream, Int32::type_name(), Int32::md5sum(), "/talker").await;
        // Half a length prefix, then hang up mid-frame.
        use tokio::io::AsyncWriteExt;
        stream.write_all(&[4, 0]).await.expect("partial frame");
    })
    .await;
    let mut harness = spawn_worker(addr);

    let notice = timeout(WAIT, harness.disconnect_rx.recv())
        .await
        .expect("no disconnect notice")
        .expect("channel open");
    assert!(matches!(notice.error, ConnectionError::TruncatedFrame));
    // Exactly one: the channel closes with no second notice.
    assert!(harness.disconnect_rx.recv().await.is_none());
    pub_task.await.expect("publisher");
}

#[tokio::test]
async fn frames_are_delivered_with_envelope() {
    let (addr, pub_task) = fake_publisher(|mut stream| async move {
        answer_handshake(&mut stream, Int32::type_name(), Int32::md5sum(), "/talker").await;
        roslink_wire::write_frame(&mut stream, &123i32.to_le_bytes())
            .await
            .expect("frame");
        roslink_wire::write_frame(&mut stream, &456i32.to_le_bytes())
            .await
            .expect("frame");
    })
    .await;
    let mut harness = spawn_worker(addr);

    let first = timeout(WAIT, harness.inbound_rx.recv())
        .await
        .expect("no payload")
        .expect("channel open");
    assert_eq!(first.payload.as_ref(), &123i32.to_le_bytes());
    assert_eq!(first.event.publisher_name, "/talker");
    assert_eq!(
        first.event.connection_header.get("type").map(String::as_str),
        Some(Int32::type_name())
    );
    let second = timeout(WAIT, harness.inbound_rx.recv())
        .await
        .expect("no payload")
        .expect("channel open");
    assert_eq!(second.payload.as_ref(), &456i32.to_le_bytes());
    pub_task.await.expect("publisher");
}

// A publisher that serves handshakes on every accepted connection, emits one
// value, then reports when the subscriber hangs up.
async fn looping_publisher(value: i32) -> (SocketAddr, mpsc::UnboundedReceiver<&'static str>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let event_tx = event_tx.clone();
            tokio::spawn(async move {
                answer_handshake(&mut stream, Int32::type_name(), Int32::md5sum(), "/talker")
                    .await;
                let _ = event_tx.send("connected");
                roslink_wire::write_frame(&mut stream, &value.to_le_bytes())
                    .await
                    .expect("frame");
                let mut buf = [0u8; 16];
                while stream.read(&mut buf).await.unwrap_or(0) != 0 {}
                let _ = event_tx.send("closed");
            });
        }
    });
    (addr, event_rx)
}

#[tokio::test]
async fn topology_updates_control_the_connection_set() {
    let (addr, mut events) = looping_publisher(123).await;
    let registry = StaticRegistry::single("node://pub", addr);
    let (dispatch, mut job_rx) = dispatch::job_queue(16);
    tokio::spawn(async move {
        while let Some(job) = job_rx.recv().await {
            job();
        }
    });

    let (value_tx, mut value_rx) = mpsc::unbounded_channel();
    let (subscriber, endpoints) = subscription::spawn::<Int32>(SpawnConfig {
        topic: TEST_TOPIC.to_string(),
        caller_id: "/sub".to_string(),
        api_uri: "node://sub".to_string(),
        registry,
        config: NodeConfig::default(),
        dispatch,
        callback: Callback::message(move |message: &Int32| {
            let _ = value_tx.send(message.data);
        }),
    });

    endpoints
        .topology_tx
        .send(vec!["node://pub".to_string()])
        .await
        .expect("topology");
    assert_eq!(
        timeout(WAIT, events.recv()).await.expect("event"),
        Some("connected")
    );
    let value = timeout(WAIT, value_rx.recv())
        .await
        .expect("no message")
        .expect("channel open");
    assert_eq!(value, 123);
    assert_eq!(subscriber.num_publishers(), 1);

    // Removing the only publisher cancels its worker; the publisher sees the
    // socket close and nothing more is dispatched.
    endpoints
        .topology_tx
        .send(Vec::new())
        .await
        .expect("topology");
    assert_eq!(
        timeout(WAIT, events.recv()).await.expect("event"),
        Some("closed")
    );
    assert!(timeout(QUIET, value_rx.recv()).await.is_err());
    assert_eq!(subscriber.num_publishers(), 0);

    // Reintroducing the publisher re-dials.
    endpoints
        .topology_tx
        .send(vec!["node://pub".to_string()])
        .await
        .expect("topology");
    assert_eq!(
        timeout(WAIT, events.recv()).await.expect("event"),
        Some("connected")
    );
    let value = timeout(WAIT, value_rx.recv())
        .await
        .expect("no message")
        .expect("channel open");
    assert_eq!(value, 123);

    endpoints.shutdown_tx.send(()).await.expect("shutdown");
    timeout(WAIT, endpoints.task).await.expect("loop exit").ok();
}

#[tokio::test]
async fn late_callbacks_only_see_later_payloads() {
    let (addr, mut events) = looping_publisher(7).await;
    let registry = StaticRegistry::single("node://pub", addr);
    let (dispatch, mut job_rx) = dispatch::job_queue(16);
    tokio::spawn(async move {
        while let Some(job) = job_rx.recv().await {
            job();
        }
    });

    let (first_tx, mut first_rx) = mpsc::unbounded_channel();
    let (subscriber, endpoints) = subscription::spawn::<Int32>(SpawnConfig {
        topic: TEST_TOPIC.to_string(),
        caller_id: "/sub".to_string(),
        api_uri: "node://sub".to_string(),
        registry,
        config: NodeConfig::default(),
        dispatch,
        callback: Callback::message(move |message: &Int32| {
            let _ = first_tx.send(message.data);
        }),
    });
    endpoints
        .topology_tx
        .send(vec!["node://pub".to_string()])
        .await
        .expect("topology");
    assert_eq!(
        timeout(WAIT, events.recv()).await.expect("event"),
        Some("connected")
    );

    // First payload reaches only the first callback.
    let value = timeout(WAIT, first_rx.recv())
        .await
        .expect("no message")
        .expect("channel open");
    assert_eq!(value, 7);

    let (late_tx, mut late_rx) = mpsc::unbounded_channel();
    subscriber
        .add_callback(Callback::message(move |message: &Int32| {
            let _ = late_tx.send(message.data);
        }))
        .await
        .expect("add callback");
    // The payload that already arrived must never reach the late callback.
    assert!(timeout(QUIET, late_rx.recv()).await.is_err());

    // A new connection delivers the next payload to both callbacks.
    endpoints.topology_tx.send(Vec::new()).await.expect("topology");
    assert_eq!(
        timeout(WAIT, events.recv()).await.expect("event"),
        Some("closed")
    );
    endpoints
        .topology_tx
        .send(vec!["node://pub".to_string()])
        .await
        .expect("topology");
    let value = timeout(WAIT, late_rx.recv())
        .await
        .expect("late callback missed the payload")
        .expect("channel open");
    assert_eq!(value, 7);
    let value = timeout(WAIT, first_rx.recv())
        .await
        .expect("first callback missed the payload")
        .expect("channel open");
    assert_eq!(value, 7);

    endpoints.shutdown_tx.send(()).await.expect("shutdown");
    timeout(WAIT, endpoints.task).await.expect("loop exit").ok();
}
