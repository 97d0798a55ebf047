// Connection worker for one (topic, publisher) pair.
//
// Dial, handshake, then a framed read loop. The quit channel is selected
// against the socket read, so cancellation unblocks promptly. Cancellation
// and a clean end of stream are quiet; every other failure produces exactly
// one disconnection notice for the coordinator.
use crate::error::ConnectionError;
use crate::subscription::{Disconnect, InboundMessage};
use bytes::BytesMut;
use roslink_msgs::MessageEvent;
use std::collections::HashMap;
use std::time::{Duration, SystemTime};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

pub(crate) struct RemoteConnConfig {
    /// Publisher identity (node API URI); keys the coordinator's state.
    pub uri: String,
    /// Negotiated `host:port` dial target.
    pub addr: String,
    pub topic: String,
    pub type_name: &'static str,
    pub md5sum: &'static str,
    pub caller_id: String,
    pub max_frame_bytes: usize,
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    pub inbound_tx: mpsc::Sender<InboundMessage>,
    pub quit_rx: mpsc::Receiver<()>,
    pub disconnect_tx: mpsc::Sender<Disconnect>,
}

pub(crate) async fn run_remote_publisher(mut config: RemoteConnConfig) {
    debug!(topic = %config.topic, publisher = %config.uri, addr = %config.addr,
        "connecting to publisher");
    match connect_and_stream(&mut config).await {
        Ok(()) => {
            debug!(topic = %config.topic, publisher = %config.uri, "connection closed");
        }
        Err(error) => {
            let _ = config
                .disconnect_tx
                .send(Disconnect {
                    uri: config.uri.clone(),
                    error,
                })
                .await;
        }
    }
}

async fn connect_and_stream(config: &mut RemoteConnConfig) -> Result<(), ConnectionError> {
    let mut stream = tokio::time::timeout(config.dial_timeout, TcpStream::connect(&config.addr))
        .await
        .map_err(|_| {
            ConnectionError::DialFailed(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connect timed out",
            ))
        })?
        .map_err(ConnectionError::DialFailed)?;
    let _ = stream.set_nodelay(true);

    // 1. Local connection header.
    let fields = [
        ("topic", config.topic.as_str()),
        ("md5sum", config.md5sum),
        ("type", config.type_name),
        ("callerid", config.caller_id.as_str()),
    ];
    roslink_wire::write_header(&mut stream, &fields)
        .await
        .map_err(ConnectionError::IoFault)?;

    // 2. Response header, bounded by the handshake timeout.
    let response = tokio::time::timeout(
        config.handshake_timeout,
        roslink_wire::read_header(&mut stream, config.max_frame_bytes),
    )
    .await
    .map_err(|_| ConnectionError::HandshakeTimeout)?
    .map_err(|err| match err {
        roslink_wire::Error::MalformedHeader(_) => ConnectionError::MalformedHeader(err),
        other => ConnectionError::IoFault(other),
    })?;
    let header: HashMap<String, String> = response.into_iter().collect();

    // The peer reports an error header instead of type/md5sum when it
    // refuses the subscription.
    let got_type = header.get("type").cloned().unwrap_or_default();
    let got_md5sum = header.get("md5sum").cloned().unwrap_or_default();
    if got_type != config.type_name || got_md5sum != config.md5sum {
        return Err(ConnectionError::IncompatibleType {
            want_type: config.type_name.to_string(),
            got_type,
            want_md5sum: config.md5sum.to_string(),
            got_md5sum,
        });
    }
    let publisher_name = header.get("callerid").cloned().unwrap_or_default();
    debug!(topic = %config.topic, publisher = %config.uri, callerid = %publisher_name,
        "handshake complete");

    // 3. Envelope template, re-stamped per frame.
    let template = MessageEvent {
        publisher_name,
        connection_header: header,
        receipt_time: SystemTime::now(),
    };

    // 4. Framed read loop.
    let mut scratch = BytesMut::with_capacity(64 * 1024);
    loop {
        tokio::select! {
            // Cancellation wins over a ready frame.
            biased;
            _ = config.quit_rx.recv() => return Ok(()),
            frame = roslink_wire::read_frame(&mut stream, &mut scratch, config.max_frame_bytes) => {
                match frame {
                    Ok(Some(payload)) => {
                        let mut event = template.clone();
                        event.receipt_time = SystemTime::now();
                        if config
                            .inbound_tx
                            .send(InboundMessage { payload, event })
                            .await
                            .is_err()
                        {
                            // Coordinator is gone; nothing left to report to.
                            return Ok(());
                        }
                    }
                    Ok(None) => return Ok(()),
                    Err(roslink_wire::Error::TruncatedFrame) => {
                        return Err(ConnectionError::TruncatedFrame);
                    }
                    Err(err) => return Err(ConnectionError::IoFault(err)),
                }
            }
        }
    }
}
