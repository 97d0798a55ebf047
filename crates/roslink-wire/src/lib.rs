// Length-prefixed wire format shared by the handshake and the message stream.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of every length prefix on the wire, handshake fields and message
/// frames alike.
pub const LEN_PREFIX: usize = 4;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("malformed header: {0}")]
    MalformedHeader(&'static str),
    #[error("truncated frame")]
    TruncatedFrame,
    #[error("frame too large: {length} bytes (cap {cap})")]
    FrameTooLarge { length: usize, cap: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Encode an ordered list of header fields into the handshake blob.
///
/// Each field becomes a 4-byte little-endian length followed by the UTF-8
/// bytes of `key=value`. The outer total-length prefix is the IO layer's
/// concern (`write_header`); this is the pure field encoding.
///
/// ```
/// let blob = roslink_wire::encode_header(&[("topic", "/chatter")]);
/// let fields = roslink_wire::decode_header(blob).expect("decode");
/// assert_eq!(fields, vec![("topic".to_string(), "/chatter".to_string())]);
/// ```
pub fn encode_header(fields: &[(&str, &str)]) -> Bytes {
    let mut buf = BytesMut::new();
    for (key, value) in fields {
        let field_len = key.len() + 1 + value.len();
        buf.put_u32_le(field_len as u32);
        buf.extend_from_slice(key.as_bytes());
        buf.put_u8(b'=');
        buf.extend_from_slice(value.as_bytes());
    }
    buf.freeze()
}

/// Decode a handshake blob back into ordered `(key, value)` fields.
pub fn decode_header(mut buf: Bytes) -> Result<Vec<(String, String)>> {
    let mut fields = Vec::new();
    while buf.has_remaining() {
        if buf.remaining() < LEN_PREFIX {
            return Err(Error::MalformedHeader("truncated field length"));
        }
        let len = buf.get_u32_le() as usize;
        if buf.remaining() < len {
            return Err(Error::MalformedHeader("field length exceeds data"));
        }
        let field = buf.copy_to_bytes(len);
        let text = std::str::from_utf8(&field)
            .map_err(|_| Error::MalformedHeader("field is not valid utf-8"))?;
        let (key, value) = text
            .split_once('=')
            .ok_or(Error::MalformedHeader("field missing '=' separator"))?;
        fields.push((key.to_string(), value.to_string()));
    }
    Ok(fields)
}

/// Write a complete connection header: one outer length prefix, then the
/// encoded fields. Mirrored exactly by `read_header`.
pub async fn write_header<W>(writer: &mut W, fields: &[(&str, &str)]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let blob = encode_header(fields);
    writer.write_u32_le(blob.len() as u32).await?;
    writer.write_all(&blob).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a complete connection header written by `write_header`.
///
/// The outer length is validated against `cap` before any allocation.
pub async fn read_header<R>(reader: &mut R, cap: usize) -> Result<Vec<(String, String)>>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; LEN_PREFIX];
    let read = read_exact_or_eof(reader, &mut len_bytes).await?;
    if read < LEN_PREFIX {
        return Err(Error::MalformedHeader("stream ended before header"));
    }
    let length = u32::from_le_bytes(len_bytes) as usize;
    if length > cap {
        return Err(Error::FrameTooLarge { length, cap });
    }
    let mut blob = vec![0u8; length];
    reader.read_exact(&mut blob).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::MalformedHeader("stream ended inside header")
        } else {
            Error::Io(err)
        }
    })?;
    decode_header(Bytes::from(blob))
}

/// Write one steady-state message frame: `[4-byte LE length][payload]`.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let length = u32::try_from(payload.len()).map_err(|_| Error::FrameTooLarge {
        length: payload.len(),
        cap: u32::MAX as usize,
    })?;
    writer.write_u32_le(length).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one steady-state message frame.
///
/// Returns `Ok(None)` on a clean end of stream (EOF exactly at a frame
/// boundary). EOF inside the length prefix or the payload is a
/// `TruncatedFrame`. The declared length is validated against `cap` before
/// allocating; `scratch` is reused across calls to avoid per-frame
/// allocations.
pub async fn read_frame<R>(
    reader: &mut R,
    scratch: &mut BytesMut,
    cap: usize,
) -> Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; LEN_PREFIX];
    let read = read_exact_or_eof(reader, &mut len_bytes).await?;
    if read == 0 {
        return Ok(None);
    }
    if read < LEN_PREFIX {
        return Err(Error::TruncatedFrame);
    }
    let length = u32::from_le_bytes(len_bytes) as usize;
    if length > cap {
        return Err(Error::FrameTooLarge { length, cap });
    }
    scratch.clear();
    scratch.resize(length, 0u8);
    reader.read_exact(&mut scratch[..]).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::TruncatedFrame
        } else {
            Error::Io(err)
        }
    })?;
    Ok(Some(scratch.split().freeze()))
}

// read_exact that reports a short count instead of failing, so callers can
// tell EOF-at-boundary apart from EOF-mid-prefix.
async fn read_exact_or_eof<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
