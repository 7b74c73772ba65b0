//! Length-prefixed JSON frame codec shared by the name-server protocol and
//! the event bus.
//!
//! Every frame is a u32-LE length followed by one JSON object. The length is
//! validated against [`MAX_FRAME_SIZE`] before any allocation, so a hostile
//! peer cannot make us buffer an arbitrary amount of input.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Upper bound for a single frame. A full migration transfer carries the
/// whole message log, so this is generous but still bounded.
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Event payloads are open maps: middlewares read and write keys, and
/// replies merge key-by-key.
pub type Payload = Map<String, Value>;

/// One event-bus frame. Exactly one of `event`/`ack` is set: `event` frames
/// carry a named event (with `seq` present when the sender wants an ack),
/// `ack` frames answer a previous `seq`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
    #[serde(default)]
    pub payload: Value,
}

impl Frame {
    pub fn event(name: impl Into<String>, payload: Value) -> Self {
        Self {
            event: Some(name.into()),
            seq: None,
            ack: None,
            payload,
        }
    }

    pub fn event_with_seq(name: impl Into<String>, seq: u64, payload: Value) -> Self {
        Self {
            event: Some(name.into()),
            seq: Some(seq),
            ack: None,
            payload,
        }
    }

    pub fn ack(seq: u64, payload: Value) -> Self {
        Self {
            event: None,
            seq: None,
            ack: Some(seq),
            payload,
        }
    }
}

/// Write one serializable value as a frame.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(value)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(Error::Malformed(format!(
            "outbound frame of {} bytes exceeds limit",
            body.len()
        )));
    }
    writer.write_all(&(body.len() as u32).to_le_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame and decode it. `Ok(None)` means the peer closed cleanly
/// at a frame boundary.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncReadExt + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(Error::Malformed(format!(
            "inbound frame of {len} bytes exceeds limit"
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

/// Merge `incoming` onto `base`. Later middlewares override earlier ones,
/// so incoming keys win.
pub fn merge_payload(base: &mut Payload, incoming: Payload) {
    for (key, value) in incoming {
        base.insert(key, value);
    }
}

/// Interpret a frame payload as an event payload map. Anything that is not
/// an object is malformed for dispatch purposes.
pub fn payload_map(value: Value) -> Result<Payload> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Payload::new()),
        other => Err(Error::Malformed(format!("expected object, got {other}"))),
    }
}

/// Fetch a string field out of a payload.
pub fn payload_str<'a>(payload: &'a Payload, key: &str) -> Option<&'a str> {
    payload.get(key).and_then(Value::as_str)
}

/// Fetch an unsigned integer field out of a payload.
pub fn payload_u64(payload: &Payload, key: &str) -> Option<u64> {
    payload.get(key).and_then(Value::as_u64)
}

/// Fetch a boolean field, treating a missing key as false.
pub fn payload_flag(payload: &Payload, key: &str) -> bool {
    payload.get(key).and_then(Value::as_bool).unwrap_or(false)
}
