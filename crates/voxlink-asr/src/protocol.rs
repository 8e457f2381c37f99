//! Binary framing of the recognizer protocol.
//!
//! Every message starts with a four-byte header:
//!
//! | byte | high nibble          | low nibble            |
//! |------|----------------------|-----------------------|
//! | 0    | protocol version     | header size (words)   |
//! | 1    | message type         | message flags         |
//! | 2    | serialization method | compression method    |
//! | 3    | reserved             | reserved              |
//!
//! Data messages follow the header with a big-endian `u32` payload length
//! and the payload. Server responses whose flags carry a sequence number
//! put a big-endian `i32` sequence before the length. Error responses
//! carry a `u32` status code and a `u32` message length before the body.

use crate::error::AsrError;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression as GzLevel;
use serde::Deserialize;
use serde_json::Value;
use std::io::{Read, Write};

pub const PROTOCOL_VERSION: u8 = 0b0001;
pub const HEADER_WORDS: u8 = 0b0001;

/// Handshake and result payloads report this code on success.
pub const SUCCESS_CODE: u32 = 1000;

pub const FLAG_NONE: u8 = 0b0000;
pub const FLAG_POSITIVE_SEQUENCE: u8 = 0b0001;
pub const FLAG_LAST_PACKET: u8 = 0b0010;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    FullClientRequest = 0b0001,
    AudioOnlyRequest = 0b0010,
    FullServerResponse = 0b1001,
    ServerAck = 0b1011,
    ServerError = 0b1111,
}

impl MessageType {
    pub fn from_nibble(n: u8) -> Option<Self> {
        match n {
            0b0001 => Some(Self::FullClientRequest),
            0b0010 => Some(Self::AudioOnlyRequest),
            0b1001 => Some(Self::FullServerResponse),
            0b1011 => Some(Self::ServerAck),
            0b1111 => Some(Self::ServerError),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Serialization {
    None = 0b0000,
    Json = 0b0001,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Compression {
    None = 0b0000,
    Gzip = 0b0001,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub message_type: MessageType,
    pub flags: u8,
    pub serialization: Serialization,
    pub compression: Compression,
}

impl Header {
    pub fn encode(&self) -> [u8; 4] {
        [
            (PROTOCOL_VERSION << 4) | HEADER_WORDS,
            ((self.message_type as u8) << 4) | (self.flags & 0x0f),
            ((self.serialization as u8) << 4) | (self.compression as u8),
            0,
        ]
    }

    /// Parses a header and returns it with the total header length in bytes.
    pub fn decode(frame: &[u8]) -> Result<(Self, usize), AsrError> {
        if frame.len() < 4 {
            return Err(AsrError::Protocol(format!(
                "frame too short for header: {} bytes",
                frame.len()
            )));
        }
        let version = frame[0] >> 4;
        if version != PROTOCOL_VERSION {
            return Err(AsrError::Protocol(format!(
                "unsupported protocol version {}",
                version
            )));
        }
        let header_len = usize::from(frame[0] & 0x0f) * 4;
        if header_len < 4 || frame.len() < header_len {
            return Err(AsrError::Protocol(format!(
                "invalid header size {} for {}-byte frame",
                header_len,
                frame.len()
            )));
        }
        let message_type = MessageType::from_nibble(frame[1] >> 4).ok_or_else(|| {
            AsrError::Protocol(format!("unknown message type {:#06b}", frame[1] >> 4))
        })?;
        let serialization = match frame[2] >> 4 {
            0 => Serialization::None,
            1 => Serialization::Json,
            other => {
                return Err(AsrError::Protocol(format!(
                    "unsupported serialization {}",
                    other
                )))
            }
        };
        let compression = match frame[2] & 0x0f {
            0 => Compression::None,
            1 => Compression::Gzip,
            other => {
                return Err(AsrError::Protocol(format!(
                    "unsupported compression {}",
                    other
                )))
            }
        };
        Ok((
            Self {
                message_type,
                flags: frame[1] & 0x0f,
                serialization,
                compression,
            },
            header_len,
        ))
    }
}

pub fn gzip(data: &[u8]) -> Result<Vec<u8>, AsrError> {
    let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub fn gunzip(data: &[u8]) -> Result<Vec<u8>, AsrError> {
    let mut out = Vec::new();
    GzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

fn frame_with_payload(header: Header, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.extend_from_slice(&header.encode());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Encodes the JSON handshake request.
pub fn encode_full_request(request: &Value) -> Result<Vec<u8>, AsrError> {
    let payload = gzip(&serde_json::to_vec(request)?)?;
    let header = Header {
        message_type: MessageType::FullClientRequest,
        flags: FLAG_NONE,
        serialization: Serialization::Json,
        compression: Compression::Gzip,
    };
    Ok(frame_with_payload(header, &payload))
}

/// Encodes one audio chunk. `last` marks the end of the utterance.
pub fn encode_audio(chunk: &[u8], last: bool) -> Result<Vec<u8>, AsrError> {
    let payload = gzip(chunk)?;
    let header = Header {
        message_type: MessageType::AudioOnlyRequest,
        flags: if last { FLAG_LAST_PACKET } else { FLAG_NONE },
        serialization: Serialization::None,
        compression: Compression::Gzip,
    };
    Ok(frame_with_payload(header, &payload))
}

/// A decoded server message.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerResponse {
    Result {
        sequence: Option<i32>,
        last: bool,
        payload: Value,
    },
    Ack {
        sequence: Option<i32>,
    },
    Error {
        code: u32,
        message: String,
    },
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn u32(&mut self) -> Result<u32, AsrError> {
        let end = self.pos + 4;
        let bytes = self
            .buf
            .get(self.pos..end)
            .ok_or_else(|| AsrError::Protocol("truncated frame".to_string()))?;
        self.pos = end;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], AsrError> {
        let end = self.pos + len;
        let bytes = self.buf.get(self.pos..end).ok_or_else(|| {
            AsrError::Protocol(format!(
                "declared payload of {} bytes exceeds frame",
                len
            ))
        })?;
        self.pos = end;
        Ok(bytes)
    }

    fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }
}

fn decode_body(header: &Header, raw: &[u8]) -> Result<Value, AsrError> {
    let body = match header.compression {
        Compression::Gzip => gunzip(raw)?,
        Compression::None => raw.to_vec(),
    };
    match header.serialization {
        Serialization::Json if !body.is_empty() => Ok(serde_json::from_slice(&body)?),
        Serialization::Json => Ok(Value::Null),
        Serialization::None => Ok(Value::String(String::from_utf8_lossy(&body).into_owned())),
    }
}

/// Decodes one binary frame received from the recognizer.
pub fn decode_response(frame: &[u8]) -> Result<ServerResponse, AsrError> {
    let (header, header_len) = Header::decode(frame)?;
    let mut cursor = Cursor {
        buf: frame,
        pos: header_len,
    };
    let sequence = if header.flags & FLAG_POSITIVE_SEQUENCE != 0 {
        Some(cursor.u32()? as i32)
    } else {
        None
    };

    match header.message_type {
        MessageType::FullServerResponse => {
            let len = cursor.u32()? as usize;
            let payload = decode_body(&header, cursor.take(len)?)?;
            Ok(ServerResponse::Result {
                sequence,
                last: header.flags & FLAG_LAST_PACKET != 0,
                payload,
            })
        }
        MessageType::ServerAck => {
            let sequence = match sequence {
                Some(s) => Some(s),
                None if cursor.remaining() >= 4 => Some(cursor.u32()? as i32),
                None => None,
            };
            Ok(ServerResponse::Ack { sequence })
        }
        MessageType::ServerError => {
            let code = cursor.u32()?;
            let len = cursor.u32()? as usize;
            let body = decode_body(&header, cursor.take(len)?)?;
            let message = match body {
                Value::String(s) => s,
                Value::Null => String::new(),
                other => other
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| other.to_string()),
            };
            Ok(ServerResponse::Error { code, message })
        }
        other => Err(AsrError::Protocol(format!(
            "unexpected client message type {:?} from server",
            other
        ))),
    }
}

/// JSON body of a full server response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecognitionPayload {
    #[serde(default)]
    pub code: Option<u32>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub result: Option<RecognitionResult>,
    #[serde(default)]
    pub audio_info: Option<AudioInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecognitionResult {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub utterances: Vec<Utterance>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Utterance {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub definite: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AudioInfo {
    /// Milliseconds of audio the recognizer has processed.
    #[serde(default)]
    pub duration: u64,
}

impl RecognitionPayload {
    pub fn is_error(&self) -> bool {
        matches!(self.code, Some(code) if code != SUCCESS_CODE)
    }

    pub fn text(&self) -> &str {
        self.result.as_ref().map(|r| r.text.as_str()).unwrap_or("")
    }

    pub fn is_definite(&self) -> bool {
        self.result
            .as_ref()
            .is_some_and(|r| r.utterances.iter().any(|u| u.definite))
    }

    pub fn duration_ms(&self) -> u64 {
        self.audio_info.as_ref().map(|a| a.duration).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn server_frame(message_type: MessageType, flags: u8, prefix: &[u8], body: &[u8]) -> Vec<u8> {
        let header = Header {
            message_type,
            flags,
            serialization: Serialization::Json,
            compression: Compression::Gzip,
        };
        let payload = gzip(body).expect("gzip");
        let mut frame = header.encode().to_vec();
        frame.extend_from_slice(prefix);
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        frame
    }

    #[test]
    fn header_nibbles_are_packed() {
        let header = Header {
            message_type: MessageType::AudioOnlyRequest,
            flags: FLAG_LAST_PACKET,
            serialization: Serialization::None,
            compression: Compression::Gzip,
        };
        assert_eq!(header.encode(), [0x11, 0x22, 0x01, 0x00]);
    }

    #[test]
    fn full_request_carries_gzipped_json_with_length() {
        let frame = encode_full_request(&json!({"audio": {"rate": 16000}})).expect("encode");
        assert_eq!(&frame[..4], &[0x11, 0x10, 0x11, 0x00]);
        let len = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]) as usize;
        assert_eq!(len, frame.len() - 8);
        let body: Value = serde_json::from_slice(&gunzip(&frame[8..]).expect("gunzip")).expect("json");
        assert_eq!(body["audio"]["rate"], 16000);
    }

    #[test]
    fn decodes_sequenced_result() {
        let body = br#"{"code":1000,"result":{"text":"hi","utterances":[{"text":"hi","definite":true}]}}"#;
        let frame = server_frame(
            MessageType::FullServerResponse,
            FLAG_POSITIVE_SEQUENCE,
            &7i32.to_be_bytes(),
            body,
        );
        match decode_response(&frame).expect("decode") {
            ServerResponse::Result {
                sequence, payload, ..
            } => {
                assert_eq!(sequence, Some(7));
                let parsed: RecognitionPayload = serde_json::from_value(payload).expect("payload");
                assert!(parsed.is_definite());
                assert_eq!(parsed.text(), "hi");
                assert!(!parsed.is_error());
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn decodes_error_frame_with_code_and_message() {
        let body = br#"{"message":"invalid app id"}"#;
        let frame = server_frame(
            MessageType::ServerError,
            FLAG_NONE,
            &45000001u32.to_be_bytes(),
            body,
        );
        assert_eq!(
            decode_response(&frame).expect("decode"),
            ServerResponse::Error {
                code: 45000001,
                message: "invalid app id".to_string()
            }
        );
    }

    #[test]
    fn truncated_payload_is_a_protocol_error() {
        let mut frame = server_frame(MessageType::FullServerResponse, FLAG_NONE, &[], b"{}");
        frame.truncate(frame.len() - 3);
        assert!(matches!(
            decode_response(&frame),
            Err(AsrError::Protocol(_))
        ));
    }

    #[test]
    fn rejects_wrong_version_and_short_frames() {
        assert!(decode_response(&[0x21, 0x90, 0x11, 0x00]).is_err());
        assert!(decode_response(&[0x11, 0x90]).is_err());
    }
}
