// Hand-maintained equivalents of the generated std_msgs scalar types, used by
// tests and demos in place of real generated code.
use crate::{Error, Message, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Int16 {
    pub data: i16,
}

impl Message for Int16 {
    fn type_name() -> &'static str {
        "std_msgs/Int16"
    }

    fn md5sum() -> &'static str {
        "8524586e34fbd7cb1c08c5f5f1ca0e57"
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i16_le(self.data);
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        if buf.remaining() < 2 {
            return Err(Error::Truncated {
                missing: 2 - buf.remaining(),
            });
        }
        Ok(Self {
            data: buf.get_i16_le(),
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Int32 {
    pub data: i32,
}

impl Message for Int32 {
    fn type_name() -> &'static str {
        "std_msgs/Int32"
    }

    fn md5sum() -> &'static str {
        "da5909fbe378aeaf85e547e830cc1bb7"
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.data);
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        if buf.remaining() < 4 {
            return Err(Error::Truncated {
                missing: 4 - buf.remaining(),
            });
        }
        Ok(Self {
            data: buf.get_i32_le(),
        })
    }
}

/// `std_msgs/String`: a length-prefixed UTF-8 string payload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct String {
    pub data: std::string::String,
}

impl Message for String {
    fn type_name() -> &'static str {
        "std_msgs/String"
    }

    fn md5sum() -> &'static str {
        "992ce8a1687cec8c8bd883ec73ca41d1"
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.data.len() as u32);
        buf.extend_from_slice(self.data.as_bytes());
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        if buf.remaining() < 4 {
            return Err(Error::Truncated {
                missing: 4 - buf.remaining(),
            });
        }
        let len = buf.get_u32_le() as usize;
        if buf.remaining() < len {
            return Err(Error::Truncated {
                missing: len - buf.remaining(),
            });
        }
        let raw = buf.copy_to_bytes(len);
        let data = std::string::String::from_utf8(raw.to_vec()).map_err(|_| Error::InvalidUtf8)?;
        Ok(Self { data })
    }
}
