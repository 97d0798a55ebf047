// Message capability surface and per-delivery metadata shared across crates.
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::time::SystemTime;

pub mod std_msgs;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("payload ended {missing} bytes early")]
    Truncated { missing: usize },
    #[error("string field is not valid utf-8")]
    InvalidUtf8,
}

/// Capability set every wire-transportable message type provides.
///
/// Generated message code implements this; the transport runtime only ever
/// sees the trait. `Default` supplies the zero value; the type name and
/// content checksum are fixed per definition and are what the connection
/// handshake validates.
///
/// ```
/// use roslink_msgs::{Message, std_msgs::Int32};
/// use bytes::BytesMut;
///
/// let mut buf = BytesMut::new();
/// Int32 { data: 123 }.encode(&mut buf);
/// let mut payload = buf.freeze();
/// assert_eq!(Int32::decode(&mut payload).expect("decode").data, 123);
/// ```
pub trait Message: Clone + Default + Send + Sync + 'static {
    /// Fully qualified type name, e.g. `std_msgs/Int32`.
    fn type_name() -> &'static str;
    /// Content checksum of the message definition.
    fn md5sum() -> &'static str;
    fn encode(&self, buf: &mut BytesMut);
    fn decode(buf: &mut Bytes) -> Result<Self>;
}

/// Delivery metadata attached to every received message.
///
/// Built once per connection when the handshake completes; the receipt time
/// is re-stamped for each frame.
#[derive(Clone, Debug)]
pub struct MessageEvent {
    /// Caller identity the publisher presented during the handshake.
    pub publisher_name: String,
    /// The full negotiated connection header.
    pub connection_header: HashMap<String, String>,
    /// Wall-clock time the frame was read off the socket.
    pub receipt_time: SystemTime,
}
