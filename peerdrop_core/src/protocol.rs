//! Wire vocabulary carried over peer data channels.
//!
//! Control messages are text frames of the form `tag:{json}` (or the bare
//! tag `end`); chunks are binary frames with a 4-byte little-endian chunk
//! index followed by the payload.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TransferError};
use crate::{FileId, FileMetadata};

pub const METADATA_TAG: &str = "metadata";
pub const HASH_TAG: &str = "hash";
pub const CHUNK_ACK_TAG: &str = "chunk-ack";
pub const END_TAG: &str = "end";
pub const CONFIRMATION_TAG: &str = "file-received-confirmation";

/// Size of the binary chunk header
pub const CHUNK_HEADER_LEN: usize = 4;

/// One message as seen by a data channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HashPayload {
    pub file_id: FileId,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAckPayload {
    pub file_id: FileId,
    pub chunk_index: u32,
    pub total_chunks: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationPayload {
    pub file_id: FileId,
    pub file_name: String,
    pub is_valid: bool,
}

/// Protocol messages exchanged during a transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// Announce an incoming file
    Metadata(FileMetadata),
    /// Late-arriving digest for large files
    Hash(HashPayload),
    /// One chunk of the file currently announced on the channel
    Chunk { index: u32, payload: Bytes },
    /// Flow-control signal for one accepted chunk
    ChunkAck(ChunkAckPayload),
    /// All chunks sent
    End,
    /// Final outcome per recipient
    Confirmation(ConfirmationPayload),
}

impl WireMessage {
    pub fn encode(&self) -> Result<Frame> {
        let frame = match self {
            WireMessage::Metadata(meta) => tagged(METADATA_TAG, meta)?,
            WireMessage::Hash(payload) => tagged(HASH_TAG, payload)?,
            WireMessage::Chunk { index, payload } => Frame::Binary(encode_chunk(*index, payload)),
            WireMessage::ChunkAck(payload) => tagged(CHUNK_ACK_TAG, payload)?,
            WireMessage::End => Frame::Text(END_TAG.to_string()),
            WireMessage::Confirmation(payload) => tagged(CONFIRMATION_TAG, payload)?,
        };
        Ok(frame)
    }

    pub fn decode(frame: Frame) -> Result<Self> {
        match frame {
            Frame::Binary(data) => decode_chunk(data),
            Frame::Text(text) => {
                if text == END_TAG {
                    return Ok(WireMessage::End);
                }
                let (tag, body) = text
                    .split_once(':')
                    .ok_or_else(|| TransferError::protocol(format!("untagged message: {text:.32}")))?;
                match tag {
                    METADATA_TAG => Ok(WireMessage::Metadata(serde_json::from_str(body)?)),
                    HASH_TAG => Ok(WireMessage::Hash(serde_json::from_str(body)?)),
                    CHUNK_ACK_TAG => Ok(WireMessage::ChunkAck(serde_json::from_str(body)?)),
                    CONFIRMATION_TAG => Ok(WireMessage::Confirmation(serde_json::from_str(body)?)),
                    other => Err(TransferError::protocol(format!("unknown tag: {other}"))),
                }
            }
        }
    }
}

fn tagged<T: Serialize>(tag: &str, payload: &T) -> Result<Frame> {
    Ok(Frame::Text(format!(
        "{}:{}",
        tag,
        serde_json::to_string(payload)?
    )))
}

/// Build a binary chunk frame: 4-byte LE index followed by the payload
pub fn encode_chunk(index: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(CHUNK_HEADER_LEN + payload.len());
    buf.put_u32_le(index);
    buf.put_slice(payload);
    buf.freeze()
}

fn decode_chunk(mut data: Bytes) -> Result<WireMessage> {
    if data.len() < CHUNK_HEADER_LEN {
        return Err(TransferError::protocol(format!(
            "binary frame too short: {} bytes",
            data.len()
        )));
    }
    let header = data.split_to(CHUNK_HEADER_LEN);
    let index = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    Ok(WireMessage::Chunk {
        index,
        payload: data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metadata() -> FileMetadata {
        FileMetadata {
            file_id: "f-1".to_string(),
            name: "report.pdf".to_string(),
            size: 40_000,
            total_chunks: 3,
            chunk_size: Some(16384),
            hash: None,
            media_type: Some("application/pdf".to_string()),
        }
    }

    #[test]
    fn test_metadata_text_format() {
        let frame = WireMessage::Metadata(sample_metadata()).encode().unwrap();
        let Frame::Text(text) = frame else {
            panic!("metadata must be a text frame");
        };
        assert!(text.starts_with("metadata:{"));
        assert!(text.contains("\"fileId\":\"f-1\""));
        assert!(text.contains("\"totalChunks\":3"));
        // Absent hash is omitted, not null
        assert!(!text.contains("hash"));
    }

    #[test]
    fn test_end_is_bare_tag() {
        assert_eq!(
            WireMessage::End.encode().unwrap(),
            Frame::Text("end".to_string())
        );
        assert_eq!(
            WireMessage::decode(Frame::Text("end".to_string())).unwrap(),
            WireMessage::End
        );
    }

    #[test]
    fn test_chunk_header_is_little_endian() {
        let frame = WireMessage::Chunk {
            index: 0x0102_0304,
            payload: Bytes::from_static(b"abc"),
        }
        .encode()
        .unwrap();
        let Frame::Binary(data) = frame.clone() else {
            panic!("chunk must be a binary frame");
        };
        assert_eq!(&data[..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&data[4..], b"abc");

        match WireMessage::decode(frame).unwrap() {
            WireMessage::Chunk { index, payload } => {
                assert_eq!(index, 0x0102_0304);
                assert_eq!(&payload[..], b"abc");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_control_messages() {
        let ack = WireMessage::decode(Frame::Text(
            r#"chunk-ack:{"fileId":"f","chunkIndex":7,"totalChunks":62}"#.to_string(),
        ))
        .unwrap();
        assert_eq!(
            ack,
            WireMessage::ChunkAck(ChunkAckPayload {
                file_id: "f".to_string(),
                chunk_index: 7,
                total_chunks: 62,
            })
        );

        let confirmation = WireMessage::decode(Frame::Text(
            r#"file-received-confirmation:{"fileId":"f","fileName":"a.txt","isValid":false}"#
                .to_string(),
        ))
        .unwrap();
        assert!(matches!(
            confirmation,
            WireMessage::Confirmation(ConfirmationPayload { is_valid: false, .. })
        ));

        let hash = WireMessage::decode(Frame::Text(
            r#"hash:{"fileId":"f","hash":"abcd"}"#.to_string(),
        ))
        .unwrap();
        assert!(matches!(hash, WireMessage::Hash(HashPayload { ref hash, .. }) if hash == "abcd"));
    }

    #[test]
    fn test_metadata_without_optional_fields() {
        let msg = WireMessage::decode(Frame::Text(
            r#"metadata:{"fileId":"x","name":"n","size":0,"totalChunks":0}"#.to_string(),
        ))
        .unwrap();
        let WireMessage::Metadata(meta) = msg else {
            panic!("expected metadata");
        };
        assert_eq!(meta.hash, None);
        assert_eq!(meta.chunk_size, None);
        assert_eq!(meta.total_chunks, 0);
    }

    #[test]
    fn test_malformed_frames_are_protocol_errors() {
        assert!(matches!(
            WireMessage::decode(Frame::Binary(Bytes::from_static(&[1, 2]))),
            Err(TransferError::Protocol { .. })
        ));
        assert!(matches!(
            WireMessage::decode(Frame::Text("bogus:{}".to_string())),
            Err(TransferError::Protocol { .. })
        ));
        assert!(matches!(
            WireMessage::decode(Frame::Text("no tag here".to_string())),
            Err(TransferError::Protocol { .. })
        ));
        assert!(matches!(
            WireMessage::decode(Frame::Text("hash:{broken".to_string())),
            Err(TransferError::Codec(_))
        ));
    }

    #[test]
    fn test_empty_chunk_payload_is_allowed() {
        let msg = WireMessage::decode(Frame::Binary(encode_chunk(5, &[]))).unwrap();
        assert!(matches!(msg, WireMessage::Chunk { index: 5, ref payload } if payload.is_empty()));
    }
}
