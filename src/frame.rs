//! Cast v2 framing: a 4-byte big-endian length prefix followed by a
//! protobuf-encoded `CastMessage`.
//!
//! Only the handful of fields the session layer needs are encoded; unknown
//! fields are skipped on decode so newer devices stay readable.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{CastError, Result};

/// Default cap on a single frame body
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

const FIELD_PROTOCOL_VERSION: u32 = 1;
const FIELD_SOURCE_ID: u32 = 2;
const FIELD_DESTINATION_ID: u32 = 3;
const FIELD_NAMESPACE: u32 = 4;
const FIELD_PAYLOAD_TYPE: u32 = 5;
const FIELD_PAYLOAD_UTF8: u32 = 6;
const FIELD_PAYLOAD_BINARY: u32 = 7;

const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_LEN: u8 = 2;
const WIRE_FIXED32: u8 = 5;

/// Payload carried by a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CastMessage {
    pub source_id: String,
    pub destination_id: String,
    pub namespace: String,
    pub payload: Payload,
}

impl CastMessage {
    /// Build a JSON text frame
    pub fn text(
        source_id: impl Into<String>,
        destination_id: impl Into<String>,
        namespace: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            destination_id: destination_id.into(),
            namespace: namespace.into(),
            payload: Payload::Text(payload.into()),
        }
    }

    /// Text payload, if this is a text frame
    pub fn text_payload(&self) -> Option<&str> {
        match &self.payload {
            Payload::Text(text) => Some(text),
            Payload::Binary(_) => None,
        }
    }

    /// Encode the protobuf body (without length prefix)
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        // CASTV2_1_0
        write_varint_field(&mut out, FIELD_PROTOCOL_VERSION, 0);
        write_bytes_field(&mut out, FIELD_SOURCE_ID, self.source_id.as_bytes());
        write_bytes_field(&mut out, FIELD_DESTINATION_ID, self.destination_id.as_bytes());
        write_bytes_field(&mut out, FIELD_NAMESPACE, self.namespace.as_bytes());
        match &self.payload {
            Payload::Text(text) => {
                write_varint_field(&mut out, FIELD_PAYLOAD_TYPE, 0);
                write_bytes_field(&mut out, FIELD_PAYLOAD_UTF8, text.as_bytes());
            }
            Payload::Binary(bytes) => {
                write_varint_field(&mut out, FIELD_PAYLOAD_TYPE, 1);
                write_bytes_field(&mut out, FIELD_PAYLOAD_BINARY, bytes);
            }
        }
        out
    }

    /// Decode a protobuf body
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = 0usize;
        let mut source_id = String::new();
        let mut destination_id = String::new();
        let mut namespace = String::new();
        let mut text = None;
        let mut binary = None;

        while cursor < bytes.len() {
            let key = read_varint(bytes, &mut cursor)
                .ok_or_else(|| CastError::InvalidFrame("bad field key".to_string()))?;
            let field = (key >> 3) as u32;
            let wire_type = (key & 0x07) as u8;

            match wire_type {
                WIRE_VARINT => {
                    read_varint(bytes, &mut cursor)
                        .ok_or_else(|| CastError::InvalidFrame("bad varint".to_string()))?;
                }
                WIRE_FIXED64 => skip(bytes, &mut cursor, 8)?,
                WIRE_FIXED32 => skip(bytes, &mut cursor, 4)?,
                WIRE_LEN => {
                    let len = read_varint(bytes, &mut cursor)
                        .ok_or_else(|| CastError::InvalidFrame("bad length".to_string()))?
                        as usize;
                    let end = cursor
                        .checked_add(len)
                        .filter(|end| *end <= bytes.len())
                        .ok_or_else(|| {
                            CastError::InvalidFrame(format!("field {field} out of bounds"))
                        })?;
                    let value = &bytes[cursor..end];
                    cursor = end;

                    match field {
                        FIELD_SOURCE_ID => source_id = utf8(value)?,
                        FIELD_DESTINATION_ID => destination_id = utf8(value)?,
                        FIELD_NAMESPACE => namespace = utf8(value)?,
                        FIELD_PAYLOAD_UTF8 => text = Some(utf8(value)?),
                        FIELD_PAYLOAD_BINARY => binary = Some(value.to_vec()),
                        _ => {}
                    }
                }
                other => {
                    return Err(CastError::InvalidFrame(format!(
                        "unsupported wire type {other}"
                    )))
                }
            }
        }

        let payload = match (text, binary) {
            (Some(text), _) => Payload::Text(text),
            (None, Some(binary)) => Payload::Binary(binary),
            (None, None) => Payload::Text(String::new()),
        };

        Ok(Self {
            source_id,
            destination_id,
            namespace,
            payload,
        })
    }
}

/// Read one frame. Returns `Ok(None)` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R, max_size: usize) -> Result<Option<CastMessage>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(CastError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    CastMessage::decode(&body).map(Some)
}

/// Write one frame and flush it
pub async fn write_frame<W>(writer: &mut W, message: &CastMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = message.encode();
    let len = u32::try_from(body.len()).map_err(|_| CastError::FrameTooLarge(body.len()))?;

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);

    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

fn utf8(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| CastError::InvalidFrame("invalid utf-8".to_string()))
}

fn skip(bytes: &[u8], cursor: &mut usize, n: usize) -> Result<()> {
    if *cursor + n > bytes.len() {
        return Err(CastError::InvalidFrame("truncated fixed field".to_string()));
    }
    *cursor += n;
    Ok(())
}

fn write_varint_field(out: &mut Vec<u8>, field: u32, value: u64) {
    write_varint(out, u64::from(field) << 3);
    write_varint(out, value);
}

fn write_bytes_field(out: &mut Vec<u8>, field: u32, value: &[u8]) {
    write_varint(out, (u64::from(field) << 3) | u64::from(WIRE_LEN));
    write_varint(out, value.len() as u64);
    out.extend_from_slice(value);
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn read_varint(bytes: &[u8], cursor: &mut usize) -> Option<u64> {
    let mut shift = 0u32;
    let mut value = 0u64;
    while *cursor < bytes.len() && shift <= 63 {
        let byte = bytes[*cursor];
        *cursor += 1;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
        shift += 7;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CastMessage {
        CastMessage::text(
            "sender-0",
            "receiver-0",
            "urn:x-cast:com.google.cast.receiver",
            r#"{"type":"GET_STATUS","requestId":1}"#,
        )
    }

    #[test]
    fn decode_skips_unknown_fields() {
        let mut body = sample().encode();
        // field 15, varint 150
        body.extend_from_slice(&[15 << 3, 0x96, 0x01]);
        // field 16, fixed32
        body.extend_from_slice(&[0x85, 0x01, 1, 2, 3, 4]);
        // field 17, length-delimited
        body.extend_from_slice(&[0x8a, 0x01, 2, b'h', b'i']);

        assert_eq!(CastMessage::decode(&body).unwrap(), sample());
    }

    #[test]
    fn decode_rejects_truncated_field() {
        let body = sample().encode();
        let err = CastMessage::decode(&body[..body.len() - 3]).unwrap_err();
        assert!(matches!(err, CastError::InvalidFrame(_)));
    }

    #[test]
    fn binary_payload_is_not_text() {
        let msg = CastMessage {
            source_id: "a".into(),
            destination_id: "b".into(),
            namespace: "urn:x-cast:custom".into(),
            payload: Payload::Binary(vec![1, 2, 3]),
        };
        let decoded = CastMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.text_payload(), None);
        assert_eq!(decoded.payload, Payload::Binary(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn frames_survive_a_byte_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, &sample()).await.unwrap();
        drop(client);

        let frame = read_frame(&mut server, DEFAULT_MAX_FRAME_SIZE).await.unwrap();
        assert_eq!(frame, Some(sample()));
        let eof = read_frame(&mut server, DEFAULT_MAX_FRAME_SIZE).await.unwrap();
        assert_eq!(eof, None);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&(1_000_000u32).to_be_bytes()).await.unwrap();

        let err = read_frame(&mut server, 1024).await.unwrap_err();
        assert!(matches!(err, CastError::FrameTooLarge(1_000_000)));
    }
}
