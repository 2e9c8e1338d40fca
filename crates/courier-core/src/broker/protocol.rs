//! Broker wire protocol.
//!
//! Every frame is a 4-byte big-endian length prefix followed by a UTF-8 JSON
//! object tagged by `op`.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//!
//! client → broker
//!   {"op":"publish","queue":"courier.requests","message":{...}}
//!   {"op":"publish","queue":"courier.replies.<id>","message":{...},"existingOnly":true}
//!   {"op":"consume","queue":"courier.requests","prefetch":4}
//!   {"op":"consume","queue":"courier.replies.<id>","prefetch":64,"exclusive":true}
//!   {"op":"ack","deliveryTag":7}
//!   {"op":"nack","deliveryTag":7,"requeue":true}
//!
//! broker → client
//!   {"op":"deliver","queue":"courier.requests","deliveryTag":7,"message":{...}}
//!   {"op":"error","message":"unknown delivery tag 9"}
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::BrokerConfig;
use crate::error::{CourierError, Result};

/// A message as stored and routed by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerMessage {
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Serialized request or reply envelope.
    pub body: String,
}

/// Frames sent by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ClientFrame {
    #[serde(rename_all = "camelCase")]
    Publish {
        queue: String,
        message: BrokerMessage,
        /// Drop the message instead of creating `queue` when it does not exist.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        existing_only: bool,
    },
    /// Start receiving from `queue` with at most `prefetch` unacked deliveries.
    ///
    /// An exclusive queue belongs to the consuming connection and is deleted,
    /// messages included, when that connection closes.
    Consume {
        queue: String,
        prefetch: u32,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        exclusive: bool,
    },
    #[serde(rename_all = "camelCase")]
    Ack { delivery_tag: u64 },
    #[serde(rename_all = "camelCase")]
    Nack { delivery_tag: u64, requeue: bool },
}

/// Frames sent by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ServerFrame {
    #[serde(rename_all = "camelCase")]
    Deliver {
        queue: String,
        delivery_tag: u64,
        message: BrokerMessage,
    },
    Error { message: String },
}

pub fn encode_frame<T: Serialize>(frame: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(frame)?)
}

pub fn decode_frame<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(payload)?)
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > BrokerConfig::MAX_FRAME_SIZE {
        return Err(CourierError::Protocol {
            message: format!(
                "frame size {} exceeds maximum {}",
                len,
                BrokerConfig::MAX_FRAME_SIZE
            ),
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > BrokerConfig::MAX_FRAME_SIZE {
        return Err(CourierError::Protocol {
            message: format!(
                "frame size {} exceeds maximum {}",
                payload.len(),
                BrokerConfig::MAX_FRAME_SIZE
            ),
        });
    }

    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> BrokerMessage {
        BrokerMessage {
            correlation_id: "c-1".to_string(),
            reply_to: Some("courier.replies.x".to_string()),
            body: "{}".to_string(),
        }
    }

    #[test]
    fn test_client_frame_tags() {
        let json = String::from_utf8(
            encode_frame(&ClientFrame::Nack {
                delivery_tag: 7,
                requeue: true,
            })
            .unwrap(),
        )
        .unwrap();
        assert_eq!(json, r#"{"op":"nack","deliveryTag":7,"requeue":true}"#);

        let json = String::from_utf8(
            encode_frame(&ClientFrame::Publish {
                queue: "q".to_string(),
                message: message(),
                existing_only: false,
            })
            .unwrap(),
        )
        .unwrap();
        assert!(json.starts_with(r#"{"op":"publish","queue":"q""#));
        assert!(json.contains(r#""correlationId":"c-1""#));
        assert!(json.contains(r#""replyTo":"courier.replies.x""#));
        assert!(!json.contains("existingOnly"));
    }

    #[test]
    fn test_reply_queue_flags_default_off() {
        let frame: ClientFrame =
            decode_frame(br#"{"op":"consume","queue":"q","prefetch":2}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Consume {
                queue: "q".to_string(),
                prefetch: 2,
                exclusive: false,
            }
        );

        let json = String::from_utf8(
            encode_frame(&ClientFrame::Consume {
                queue: "r".to_string(),
                prefetch: 1,
                exclusive: true,
            })
            .unwrap(),
        )
        .unwrap();
        assert_eq!(json, r#"{"op":"consume","queue":"r","prefetch":1,"exclusive":true}"#);
    }

    #[test]
    fn test_server_frame_parses() {
        let frame: ServerFrame = decode_frame(
            br#"{"op":"deliver","queue":"q","deliveryTag":3,"message":{"correlationId":"c","body":"b"}}"#,
        )
        .unwrap();
        match frame {
            ServerFrame::Deliver {
                delivery_tag,
                message,
                ..
            } => {
                assert_eq!(delivery_tag, 3);
                assert_eq!(message.reply_to, None);
            }
            other => panic!("Expected deliver frame, got: {:?}", other),
        }

        assert!(decode_frame::<ServerFrame>(br#"{"op":"bogus"}"#).is_err());
    }

    #[tokio::test]
    async fn test_frame_read_write() {
        let payload = encode_frame(&ClientFrame::Ack { delivery_tag: 1 }).unwrap();
        let mut buf = Vec::new();
        write_frame(&mut buf, &payload).await.unwrap();
        assert_eq!(&buf[..4], &(payload.len() as u32).to_be_bytes());

        let mut cursor = std::io::Cursor::new(buf);
        let read_back = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(
            decode_frame::<ClientFrame>(&read_back).unwrap(),
            ClientFrame::Ack { delivery_tag: 1 }
        );
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frame_read_oversized_returns_error() {
        let huge_len: u32 = (BrokerConfig::MAX_FRAME_SIZE + 1) as u32;
        let mut buf = Vec::new();
        buf.extend_from_slice(&huge_len.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);

        let mut cursor = std::io::Cursor::new(buf);
        let result = read_frame(&mut cursor).await;
        assert!(matches!(result, Err(CourierError::Protocol { .. })));
    }
}
