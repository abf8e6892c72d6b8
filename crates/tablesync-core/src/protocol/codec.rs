//! Binary codec for the upstream table-sync protocol.
//!
//! Wire format:
//! ```text
//! [version:1][msg_type:1][reserved:2][payload_len:4][seq:8][timestamp_us:8][payload:N]
//! ```
//! Total header size: 24 bytes. All multi-byte integers are big-endian.
//!
//! Values are encoded as a type byte (see [`ValueType`]) followed by data:
//!
//! ```text
//! boolean       [0|1]
//! double        [f64 bits:8]
//! string        [len:4][utf8]
//! raw           [len:4][bytes]
//! boolean[]     [count:4][0|1]*
//! double[]      [count:4][f64 bits:8]*
//! string[]      [count:4]([len:4][utf8])*
//! ```
//!
//! Keys and identities use a 2-byte length prefix.

use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::domain::value::{Value, ValueType};
use crate::protocol::messages::{
    DisconnectReason, EntryRecord, ErrorCode, ErrorMessage, HelloAckMessage, HelloMessage,
    MessageType, SyncMessage, SyncRole, HEADER_SIZE, MAX_PAYLOAD_LEN, PROTOCOL_VERSION,
};

/// Errors that can occur during message encoding or decoding.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The byte slice is shorter than the minimum required length.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    #[error("unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// The payload could not be parsed (bad type byte, UTF-8 error, truncated field, etc.).
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The header declares more payload than is available yet.
    #[error("payload length mismatch: header says {declared}, available is {available}")]
    PayloadLengthMismatch { declared: usize, available: usize },

    /// The payload exceeds [`MAX_PAYLOAD_LEN`].
    #[error("payload of {len} bytes exceeds the {max}-byte limit")]
    PayloadTooLarge { len: usize, max: usize },
}

impl ProtocolError {
    /// Returns `true` when more bytes could turn this error into a success.
    ///
    /// Streaming readers use this to tell "wait for more data" apart from
    /// "this stream is corrupt".
    pub fn is_incomplete(&self) -> bool {
        matches!(
            self,
            ProtocolError::InsufficientData { .. } | ProtocolError::PayloadLengthMismatch { .. }
        )
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a [`SyncMessage`] into a byte vector including the 24-byte header.
///
/// The sequence number is **not** set by this function – pass a value from a
/// [`crate::protocol::SequenceCounter`].
///
/// # Errors
///
/// Returns [`ProtocolError::PayloadTooLarge`] if the encoded payload exceeds
/// [`MAX_PAYLOAD_LEN`].
///
/// # Examples
///
/// ```rust
/// use tablesync_core::protocol::{decode_message, encode_message};
/// use tablesync_core::protocol::messages::SyncMessage;
///
/// let msg = SyncMessage::Ping(42);
/// let bytes = encode_message(&msg, 0, 0).unwrap();
/// let (decoded, consumed) = decode_message(&bytes).unwrap();
/// assert_eq!(decoded, msg);
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn encode_message(
    msg: &SyncMessage,
    sequence_number: u64,
    timestamp_us: u64,
) -> Result<Vec<u8>, ProtocolError> {
    let payload = encode_payload(msg);
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.push(PROTOCOL_VERSION);
    buf.push(msg.message_type() as u8);
    buf.extend_from_slice(&[0x00, 0x00]); // reserved
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&sequence_number.to_be_bytes());
    buf.extend_from_slice(&timestamp_us.to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Encodes a [`SyncMessage`] using the current system time as the timestamp.
///
/// # Errors
///
/// See [`encode_message`].
pub fn encode_message_now(msg: &SyncMessage, sequence_number: u64) -> Result<Vec<u8>, ProtocolError> {
    let timestamp_us = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64;
    encode_message(msg, sequence_number, timestamp_us)
}

/// Decodes one [`SyncMessage`] from the beginning of `bytes`.
///
/// Returns the decoded message and the total number of bytes consumed
/// (header + payload), so the caller can advance its read cursor.
///
/// # Errors
///
/// Returns [`ProtocolError`] if the bytes are malformed or incomplete; see
/// [`ProtocolError::is_incomplete`].
pub fn decode_message(bytes: &[u8]) -> Result<(SyncMessage, usize), ProtocolError> {
    if bytes.len() < HEADER_SIZE {
        return Err(ProtocolError::InsufficientData {
            needed: HEADER_SIZE,
            available: bytes.len(),
        });
    }

    let version = bytes[0];
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }

    let type_byte = bytes[1];
    let msg_type =
        MessageType::try_from(type_byte).map_err(|_| ProtocolError::UnknownMessageType(type_byte))?;

    // bytes[2..4] are reserved – ignored on decode

    let payload_len = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::PayloadTooLarge {
            len: payload_len,
            max: MAX_PAYLOAD_LEN,
        });
    }

    let total = HEADER_SIZE + payload_len;
    if bytes.len() < total {
        return Err(ProtocolError::PayloadLengthMismatch {
            declared: payload_len,
            available: bytes.len() - HEADER_SIZE,
        });
    }

    let msg = decode_payload(msg_type, &bytes[HEADER_SIZE..total])?;
    Ok((msg, total))
}

// ── Payload encoding ──────────────────────────────────────────────────────────

fn encode_payload(msg: &SyncMessage) -> Vec<u8> {
    let mut buf = Vec::new();
    match msg {
        SyncMessage::Hello(m) => {
            write_short_string(&mut buf, &m.identity);
            buf.push(m.protocol_version);
            buf.push(m.role as u8);
        }
        SyncMessage::HelloAck(m) => {
            write_short_string(&mut buf, &m.server_identity);
            buf.push(u8::from(m.accepted));
        }
        SyncMessage::Snapshot(records) => {
            buf.extend_from_slice(&(records.len() as u32).to_be_bytes());
            for record in records {
                encode_record(&mut buf, record);
            }
        }
        SyncMessage::Ping(token) | SyncMessage::Pong(token) => {
            buf.extend_from_slice(&token.to_be_bytes());
        }
        SyncMessage::Disconnect { reason } => buf.push(*reason as u8),
        SyncMessage::Error(m) => {
            buf.push(m.code as u8);
            write_short_string(&mut buf, &m.description);
        }
        SyncMessage::EntryUpdate(record) => encode_record(&mut buf, record),
        SyncMessage::EntryDelete { key, version } => {
            write_short_string(&mut buf, key);
            buf.extend_from_slice(&version.to_be_bytes());
        }
    }
    buf
}

fn encode_record(buf: &mut Vec<u8>, record: &EntryRecord) {
    write_short_string(buf, &record.key);
    buf.extend_from_slice(&record.version.to_be_bytes());
    encode_value(buf, &record.value);
}

fn encode_value(buf: &mut Vec<u8>, value: &Value) {
    buf.push(value.value_type() as u8);
    match value {
        Value::Boolean(b) => buf.push(u8::from(*b)),
        Value::Double(d) => buf.extend_from_slice(&d.to_be_bytes()),
        Value::String(s) => write_long_bytes(buf, s.as_bytes()),
        Value::Raw(bytes) => write_long_bytes(buf, bytes),
        Value::BooleanArray(items) => {
            buf.extend_from_slice(&(items.len() as u32).to_be_bytes());
            buf.extend(items.iter().map(|b| u8::from(*b)));
        }
        Value::DoubleArray(items) => {
            buf.extend_from_slice(&(items.len() as u32).to_be_bytes());
            for d in items {
                buf.extend_from_slice(&d.to_be_bytes());
            }
        }
        Value::StringArray(items) => {
            buf.extend_from_slice(&(items.len() as u32).to_be_bytes());
            for s in items {
                write_long_bytes(buf, s.as_bytes());
            }
        }
    }
}

// ── Payload decoding ──────────────────────────────────────────────────────────

fn decode_payload(msg_type: MessageType, payload: &[u8]) -> Result<SyncMessage, ProtocolError> {
    let mut r = PayloadReader::new(payload);
    let msg = match msg_type {
        MessageType::Hello => {
            let identity = r.short_string("Hello.identity")?;
            let protocol_version = r.u8("Hello.protocol_version")?;
            let role_byte = r.u8("Hello.role")?;
            let role = SyncRole::try_from(role_byte).map_err(|_| {
                ProtocolError::MalformedPayload(format!("unknown role: {role_byte}"))
            })?;
            SyncMessage::Hello(HelloMessage {
                identity,
                protocol_version,
                role,
            })
        }
        MessageType::HelloAck => {
            let server_identity = r.short_string("HelloAck.server_identity")?;
            let accepted = r.u8("HelloAck.accepted")? != 0;
            SyncMessage::HelloAck(HelloAckMessage {
                server_identity,
                accepted,
            })
        }
        MessageType::Snapshot => {
            let count = r.u32("Snapshot.count")? as usize;
            // Each record needs at least 2 (key len) + 8 (version) + 1 (type) bytes.
            let mut records = Vec::with_capacity(count.min(r.remaining() / 11));
            for _ in 0..count {
                records.push(decode_record(&mut r)?);
            }
            SyncMessage::Snapshot(records)
        }
        MessageType::Ping => SyncMessage::Ping(r.u64("Ping.token")?),
        MessageType::Pong => SyncMessage::Pong(r.u64("Pong.token")?),
        MessageType::Disconnect => {
            let byte = r.u8("Disconnect.reason")?;
            let reason = DisconnectReason::try_from(byte).map_err(|_| {
                ProtocolError::MalformedPayload(format!("unknown disconnect reason: {byte}"))
            })?;
            SyncMessage::Disconnect { reason }
        }
        MessageType::Error => {
            let code = ErrorCode::from(r.u8("Error.code")?);
            let description = r.short_string("Error.description")?;
            SyncMessage::Error(ErrorMessage { code, description })
        }
        MessageType::EntryUpdate => SyncMessage::EntryUpdate(decode_record(&mut r)?),
        MessageType::EntryDelete => {
            let key = r.short_string("EntryDelete.key")?;
            let version = r.u64("EntryDelete.version")?;
            SyncMessage::EntryDelete { key, version }
        }
    };
    Ok(msg)
}

fn decode_record(r: &mut PayloadReader<'_>) -> Result<EntryRecord, ProtocolError> {
    let key = r.short_string("record.key")?;
    let version = r.u64("record.version")?;
    let value = decode_value(r)?;
    Ok(EntryRecord { key, value, version })
}

fn decode_value(r: &mut PayloadReader<'_>) -> Result<Value, ProtocolError> {
    let type_byte = r.u8("value.type")?;
    let value_type = ValueType::try_from(type_byte)
        .map_err(|_| ProtocolError::MalformedPayload(format!("unknown value type: 0x{type_byte:02X}")))?;
    let value = match value_type {
        ValueType::Boolean => Value::Boolean(r.u8("boolean")? != 0),
        ValueType::Double => Value::Double(f64::from_bits(r.u64("double")?)),
        ValueType::String => Value::String(r.long_string("string")?),
        ValueType::Raw => Value::Raw(r.long_bytes("raw")?.to_vec()),
        ValueType::BooleanArray => {
            let count = r.u32("boolean[].count")? as usize;
            let bytes = r.take(count, "boolean[]")?;
            Value::BooleanArray(bytes.iter().map(|b| *b != 0).collect())
        }
        ValueType::DoubleArray => {
            let count = r.u32("double[].count")? as usize;
            let needed = count.checked_mul(8).ok_or_else(|| {
                ProtocolError::MalformedPayload(format!("double[] count {count} overflows"))
            })?;
            let bytes = r.take(needed, "double[]")?;
            Value::DoubleArray(
                bytes
                    .chunks_exact(8)
                    .map(|c| f64::from_be_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                    .collect(),
            )
        }
        ValueType::StringArray => {
            let count = r.u32("string[].count")? as usize;
            // Each element needs at least its 4-byte length prefix.
            let mut items = Vec::with_capacity(count.min(r.remaining() / 4));
            for _ in 0..count {
                items.push(r.long_string("string[] item")?);
            }
            Value::StringArray(items)
        }
    };
    Ok(value)
}

// ── Utility helpers ───────────────────────────────────────────────────────────

/// Writes a 2-byte length prefix followed by the UTF-8 string bytes.
///
/// Strings longer than `u16::MAX` bytes are truncated at a char boundary.
fn write_short_string(buf: &mut Vec<u8>, s: &str) {
    let mut len = s.len().min(u16::MAX as usize);
    while !s.is_char_boundary(len) {
        len -= 1;
    }
    buf.extend_from_slice(&(len as u16).to_be_bytes());
    buf.extend_from_slice(&s.as_bytes()[..len]);
}

/// Writes a 4-byte length prefix followed by the bytes.
fn write_long_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
}

/// Bounds-checked cursor over a payload slice.
///
/// Every read names the field it is reading so malformed frames produce a
/// useful [`ProtocolError::MalformedPayload`].
struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize, context: &str) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::MalformedPayload(format!(
                "{context}: need {n} bytes at offset {}, got {}",
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self, context: &str) -> Result<u8, ProtocolError> {
        Ok(self.take(1, context)?[0])
    }

    fn u16(&mut self, context: &str) -> Result<u16, ProtocolError> {
        let b = self.take(2, context)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self, context: &str) -> Result<u32, ProtocolError> {
        let b = self.take(4, context)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self, context: &str) -> Result<u64, ProtocolError> {
        let b = self.take(8, context)?;
        Ok(u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    fn short_string(&mut self, context: &str) -> Result<String, ProtocolError> {
        let len = self.u16(context)? as usize;
        let bytes = self.take(len, context)?;
        utf8(bytes, context)
    }

    fn long_bytes(&mut self, context: &str) -> Result<&'a [u8], ProtocolError> {
        let len = self.u32(context)? as usize;
        self.take(len, context)
    }

    fn long_string(&mut self, context: &str) -> Result<String, ProtocolError> {
        let bytes = self.long_bytes(context)?;
        utf8(bytes, context)
    }
}

fn utf8(bytes: &[u8], context: &str) -> Result<String, ProtocolError> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|e| ProtocolError::MalformedPayload(format!("{context}: invalid UTF-8: {e}")))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
