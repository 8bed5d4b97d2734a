//! Peer wire messages
//!
//! The whole peer dialogue is a tagged union decoded once at the
//! transport boundary; everything above the wire layer works with
//! `Message` variants, never raw bytes.

use anyhow::Result;
use bytes::{Buf, BufMut, BytesMut};
use tracing::trace;

use crate::error::EngineError;

/// Wire identifiers for typed messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            9 => Ok(MessageId::Port),
            20 => Ok(MessageId::Extended),
            other => Err(EngineError::protocol_with_detail(
                "Unknown message id",
                format!("id {}", other),
            )
            .into()),
        }
    }
}

/// A decoded peer message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece: u32 },
    Bitfield { bits: Vec<u8> },
    Request { piece: u32, offset: u32, length: u32 },
    Piece { piece: u32, offset: u32, data: Vec<u8> },
    Cancel { piece: u32, offset: u32, length: u32 },
    Port { port: u16 },
    /// Extension-protocol envelope; payload stays opaque to the engine
    Extended { id: u8, payload: Vec<u8> },
}

impl Message {
    /// Wire id of the message (`None` for keep-alive)
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield { .. } => Some(MessageId::Bitfield),
            Message::Request { .. } => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel { .. } => Some(MessageId::Cancel),
            Message::Port { .. } => Some(MessageId::Port),
            Message::Extended { .. } => Some(MessageId::Extended),
        }
    }

    /// Payload length excluding the four-byte prefix
    pub fn payload_len(&self) -> u32 {
        match self {
            Message::KeepAlive => 0,
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => 1,
            Message::Have { .. } => 5,
            Message::Bitfield { bits } => 1 + bits.len() as u32,
            Message::Request { .. } | Message::Cancel { .. } => 13,
            Message::Piece { data, .. } => 9 + data.len() as u32,
            Message::Port { .. } => 3,
            Message::Extended { payload, .. } => 2 + payload.len() as u32,
        }
    }

    /// Encode with the length prefix
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(4 + self.payload_len() as usize);
        buf.put_u32(self.payload_len());
        if let Some(id) = self.id() {
            buf.put_u8(id as u8);
        }
        match self {
            Message::Have { piece } => buf.put_u32(*piece),
            Message::Bitfield { bits } => buf.put_slice(bits),
            Message::Request { piece, offset, length }
            | Message::Cancel { piece, offset, length } => {
                buf.put_u32(*piece);
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            Message::Piece { piece, offset, data } => {
                buf.put_u32(*piece);
                buf.put_u32(*offset);
                buf.put_slice(data);
            }
            Message::Port { port } => buf.put_u16(*port),
            Message::Extended { id, payload } => {
                buf.put_u8(*id);
                buf.put_slice(payload);
            }
            _ => {}
        }
        trace!(len = buf.len(), "encoded message");
        buf.to_vec()
    }

    /// Decode a message payload (length prefix already stripped)
    ///
    /// An empty payload is a keep-alive.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.is_empty() {
            return Ok(Message::KeepAlive);
        }
        let mut buf = payload;
        let id = MessageId::try_from(buf.get_u8())?;
        let msg = match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                require(buf.remaining(), 4, "have")?;
                Message::Have { piece: buf.get_u32() }
            }
            MessageId::Bitfield => Message::Bitfield { bits: buf.to_vec() },
            MessageId::Request => {
                require(buf.remaining(), 12, "request")?;
                Message::Request {
                    piece: buf.get_u32(),
                    offset: buf.get_u32(),
                    length: buf.get_u32(),
                }
            }
            MessageId::Piece => {
                require(buf.remaining(), 8, "piece")?;
                Message::Piece {
                    piece: buf.get_u32(),
                    offset: buf.get_u32(),
                    data: buf.to_vec(),
                }
            }
            MessageId::Cancel => {
                require(buf.remaining(), 12, "cancel")?;
                Message::Cancel {
                    piece: buf.get_u32(),
                    offset: buf.get_u32(),
                    length: buf.get_u32(),
                }
            }
            MessageId::Port => {
                require(buf.remaining(), 2, "port")?;
                Message::Port { port: buf.get_u16() }
            }
            MessageId::Extended => {
                require(buf.remaining(), 1, "extended")?;
                Message::Extended {
                    id: buf.get_u8(),
                    payload: buf.to_vec(),
                }
            }
        };
        trace!(?id, "decoded message");
        Ok(msg)
    }
}

fn require(remaining: usize, needed: usize, kind: &str) -> Result<()> {
    if remaining < needed {
        return Err(EngineError::protocol_with_detail(
            "Truncated message",
            format!("{} needs {} bytes, got {}", kind, needed, remaining),
        )
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: Message) -> Message {
        let encoded = msg.encode();
        // Strip the four-byte prefix, as the wire layer does
        Message::decode(&encoded[4..]).unwrap()
    }

    #[test]
    fn test_keepalive_is_bare_prefix() {
        assert_eq!(Message::KeepAlive.encode(), vec![0, 0, 0, 0]);
        assert_eq!(Message::decode(&[]).unwrap(), Message::KeepAlive);
    }

    #[test]
    fn test_flag_messages_round_trip() {
        for msg in [
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
        ] {
            assert_eq!(round_trip(msg.clone()), msg);
        }
    }

    #[test]
    fn test_request_round_trip() {
        let msg = Message::Request {
            piece: 12,
            offset: 16384,
            length: 16384,
        };
        assert_eq!(round_trip(msg.clone()), msg);
        assert_eq!(msg.payload_len(), 13);
    }

    #[test]
    fn test_piece_carries_data() {
        let msg = Message::Piece {
            piece: 3,
            offset: 0,
            data: vec![9u8; 64],
        };
        assert_eq!(msg.payload_len(), 9 + 64);
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn test_extended_round_trip() {
        let msg = Message::Extended {
            id: 1,
            payload: b"d1:md11:ut_metadatai1eee".to_vec(),
        };
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn test_unknown_id_rejected() {
        assert!(Message::decode(&[42]).is_err());
    }

    #[test]
    fn test_truncated_request_rejected() {
        let err = Message::decode(&[MessageId::Request as u8, 0, 0]).unwrap_err();
        assert!(err.to_string().contains("Truncated"));
    }

    #[test]
    fn test_have_round_trip_and_length() {
        let msg = Message::Have { piece: 99 };
        assert_eq!(msg.payload_len(), 5);
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn test_port_round_trip() {
        let msg = Message::Port { port: 6881 };
        assert_eq!(round_trip(msg.clone()), msg);
    }
}
