//! Wire framing for RPC messages.
//!
//! Every frame carries the shared token, the sender, the destination, an
//! optional proxy receiver, and the opaque payload, in that order. Each
//! variable-length field is preceded by a fixed-width ASCII-decimal length
//! prefix (two digits for the token, three for routing fields), so a field
//! that legitimately reaches its maximum length still round-trips exactly.

use bytes::{BufMut, Bytes, BytesMut};

use crate::types::{Destination, Receiver, Sender};

/// Maximum byte length of a name, instance id, or handler name.
pub const MAX_FIELD_LEN: usize = 255;

/// Maximum byte length of the shared token.
pub const MAX_TOKEN_LEN: usize = 99;

/// Errors raised while encoding or decoding frames.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty frame body")]
    EmptyBody,

    #[error("frame token does not match the configured token")]
    InvalidToken,

    #[error("field '{field}' is {len} bytes, limit is {max}")]
    InvalidLength {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),
}

/// A decoded frame.
///
/// The `broadcast` flags on [`Destination`] and [`Receiver`] are
/// publish-side routing metadata and are not carried on the wire; decoded
/// values always have them unset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub sender: Sender,
    pub destination: Destination,
    pub receiver: Receiver,
    pub payload: Bytes,
}

/// Encoder/decoder bound to one configured token.
#[derive(Debug, Clone)]
pub struct Codec {
    token: String,
}

impl Codec {
    /// Create a codec for the given shared token.
    pub fn new(token: impl Into<String>) -> Result<Self, ProtocolError> {
        let token = token.into();
        check_len("token", &token, MAX_TOKEN_LEN)?;
        Ok(Self { token })
    }

    /// Encode a frame.
    ///
    /// Fields are emitted in order: token, sender name/instance,
    /// destination name/instance/handler, receiver name/instance/handler,
    /// raw payload. Absent fields are encoded as zero-length, never
    /// omitted. Fails with [`ProtocolError::InvalidLength`] if any field
    /// exceeds its bound.
    pub fn encode(
        &self,
        sender: &Sender,
        destination: &Destination,
        receiver: &Receiver,
        payload: &[u8],
    ) -> Result<Bytes, ProtocolError> {
        let fields: [(&'static str, &str); 8] = [
            ("sender.name", &sender.name),
            ("sender.instance", &sender.instance),
            ("destination.name", &destination.name),
            ("destination.instance", &destination.instance),
            ("destination.handler", &destination.handler),
            ("receiver.name", &receiver.name),
            ("receiver.instance", &receiver.instance),
            ("receiver.handler", &receiver.handler),
        ];

        for (name, value) in &fields {
            check_len(name, value, MAX_FIELD_LEN)?;
        }

        let header = 2 + self.token.len() + fields.iter().map(|(_, v)| 3 + v.len()).sum::<usize>();
        let mut buf = BytesMut::with_capacity(header + payload.len());

        put_prefixed(&mut buf, &self.token, 2);
        for (_, value) in &fields {
            put_prefixed(&mut buf, value, 3);
        }
        buf.put_slice(payload);

        Ok(buf.freeze())
    }

    /// Decode a frame, verifying its token against the configured one.
    ///
    /// Exact inverse of [`Codec::encode`] for all in-bound inputs.
    pub fn decode(&self, body: &[u8]) -> Result<Frame, ProtocolError> {
        if body.is_empty() {
            return Err(ProtocolError::EmptyBody);
        }

        let mut pos = 0;
        let token = read_field(body, &mut pos, 2, "token", MAX_TOKEN_LEN)?;
        if token != self.token {
            return Err(ProtocolError::InvalidToken);
        }

        let sender = Sender {
            name: read_field(body, &mut pos, 3, "sender.name", MAX_FIELD_LEN)?,
            instance: read_field(body, &mut pos, 3, "sender.instance", MAX_FIELD_LEN)?,
        };
        let destination = Destination {
            name: read_field(body, &mut pos, 3, "destination.name", MAX_FIELD_LEN)?,
            instance: read_field(body, &mut pos, 3, "destination.instance", MAX_FIELD_LEN)?,
            handler: read_field(body, &mut pos, 3, "destination.handler", MAX_FIELD_LEN)?,
            broadcast: false,
        };
        let receiver = Receiver {
            name: read_field(body, &mut pos, 3, "receiver.name", MAX_FIELD_LEN)?,
            instance: read_field(body, &mut pos, 3, "receiver.instance", MAX_FIELD_LEN)?,
            handler: read_field(body, &mut pos, 3, "receiver.handler", MAX_FIELD_LEN)?,
            broadcast: false,
        };

        Ok(Frame {
            sender,
            destination,
            receiver,
            payload: Bytes::copy_from_slice(&body[pos..]),
        })
    }
}

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), ProtocolError> {
    if value.len() > max {
        return Err(ProtocolError::InvalidLength {
            field,
            len: value.len(),
            max,
        });
    }
    Ok(())
}

/// Write `{len:0digits}` followed by the field bytes.
fn put_prefixed(buf: &mut BytesMut, value: &str, digits: usize) {
    let mut prefix = [b'0'; 3];
    let mut len = value.len();
    for slot in prefix[..digits].iter_mut().rev() {
        *slot = b'0' + (len % 10) as u8;
        len /= 10;
    }
    buf.put_slice(&prefix[..digits]);
    buf.put_slice(value.as_bytes());
}

/// Read a fixed-width decimal length prefix, then the field it describes.
fn read_field(
    body: &[u8],
    pos: &mut usize,
    digits: usize,
    field: &'static str,
    max: usize,
) -> Result<String, ProtocolError> {
    let prefix_end = *pos + digits;
    if body.len() < prefix_end {
        return Err(ProtocolError::MalformedFrame("truncated length prefix"));
    }

    let mut len = 0usize;
    for &b in &body[*pos..prefix_end] {
        if !b.is_ascii_digit() {
            return Err(ProtocolError::MalformedFrame("non-numeric length prefix"));
        }
        len = len * 10 + (b - b'0') as usize;
    }

    if len > max {
        return Err(ProtocolError::InvalidLength { field, len, max });
    }

    let field_end = prefix_end + len;
    if body.len() < field_end {
        return Err(ProtocolError::MalformedFrame("field runs past end of frame"));
    }

    let value = std::str::from_utf8(&body[prefix_end..field_end])
        .map_err(|_| ProtocolError::MalformedFrame("field is not valid UTF-8"))?
        .to_string();
    *pos = field_end;

    Ok(value)
}
