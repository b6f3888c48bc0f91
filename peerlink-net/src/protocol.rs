//! Frame multiplexing over the relay connection.
//!
//! Every peerlink client keeps exactly one physical connection to the relay.
//! Traffic for all remote peers shares that connection: each message on it is
//! a self-contained JSON document tagged with the peer it belongs to.
//!
//! ```text
//! Single relay connection
//!     ├── {"type":"p2p","peer_id":"alice","payload":"aGVsbG8="}
//!     ├── {"type":"p2p","peer_id":"bob","payload":"eyJ0eXBlIjoidHVubmVsIn0="}
//!     ├── {"type":"p2p","peer_id":"alice","payload":""}
//!     └── ...
//! ```
//!
//! The relay rewrites `peer_id` on delivery: a frame sent *to* `bob` reaches
//! bob tagged with the sender's identifier, so replies are addressed by simply
//! echoing the tag back.
//!
//! # Payload encoding
//!
//! Payloads are opaque bytes carried as standard base64 so that the frame body
//! stays valid UTF-8 text regardless of what is being tunnelled.
//!
//! # End of stream
//!
//! A frame with an empty payload carries no data. Tunnel sessions use it as
//! the end-of-stream marker (see [`Frame::is_end_of_stream`]).
//!
//! # Other message types
//!
//! The relay may send messages with a `type` other than `p2p` (status,
//! errors, future extensions). They are decoded as [`Incoming::Other`] and
//! never routed to a peer.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;

/// Message type of peer-addressed frames.
pub const FRAME_TYPE_P2P: &str = "p2p";

/// One routed unit of data on the relay connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub peer_id: String,
    pub payload: Bytes,
}

/// A decoded relay message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// Peer-addressed data.
    Frame(Frame),
    /// Any other message type, identified by its `type` field.
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("frame is missing the `{0}` field")]
    MissingField(&'static str),

    #[error("invalid base64 payload: {source}")]
    Payload {
        #[from]
        source: base64::DecodeError,
    },
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct WireMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    peer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
}

impl Frame {
    pub fn new(peer_id: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            peer_id: peer_id.into(),
            payload: payload.into(),
        }
    }

    /// The end-of-stream marker for `peer_id`.
    pub fn end_of_stream(peer_id: impl Into<String>) -> Self {
        Self::new(peer_id, Bytes::new())
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.payload.is_empty()
    }

    /// Encode as the JSON text body sent on the relay connection.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&WireMessage {
            kind: FRAME_TYPE_P2P.to_string(),
            peer_id: Some(self.peer_id.clone()),
            payload: Some(STANDARD.encode(&self.payload)),
        })
    }
}

/// Decode one text message received from the relay.
pub fn decode(text: &str) -> Result<Incoming, DecodeError> {
    let message: WireMessage = serde_json::from_str(text)?;

    if message.kind != FRAME_TYPE_P2P {
        return Ok(Incoming::Other(message.kind));
    }

    let peer_id = message.peer_id.ok_or(DecodeError::MissingField("peer_id"))?;
    let payload = message.payload.ok_or(DecodeError::MissingField("payload"))?;
    let payload = STANDARD.decode(payload)?;

    Ok(Incoming::Frame(Frame {
        peer_id,
        payload: Bytes::from(payload),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_matches_wire_contract() {
        let frame = Frame::new("bob", &b"hello"[..]);
        let text = frame.encode().unwrap();
        assert_eq!(
            text,
            r#"{"type":"p2p","peer_id":"bob","payload":"aGVsbG8="}"#
        );
    }

    #[test]
    fn test_decode_frame() {
        let incoming = decode(r#"{"type":"p2p","peer_id":"alice","payload":"aGk="}"#).unwrap();
        assert_eq!(incoming, Incoming::Frame(Frame::new("alice", &b"hi"[..])));
    }

    #[test]
    fn test_decode_end_of_stream() {
        let incoming = decode(r#"{"type":"p2p","peer_id":"alice","payload":""}"#).unwrap();
        match incoming {
            Incoming::Frame(frame) => assert!(frame.is_end_of_stream()),
            other => panic!("Expected a frame, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_other_type() {
        let incoming = decode(r#"{"type":"welcome","server":"relay-1"}"#).unwrap();
        assert_eq!(incoming, Incoming::Other("welcome".to_string()));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode("not json"), Err(DecodeError::Json { .. })));
        assert!(matches!(
            decode(r#"{"type":"p2p","payload":"aGk="}"#),
            Err(DecodeError::MissingField("peer_id"))
        ));
        assert!(matches!(
            decode(r#"{"type":"p2p","peer_id":"x","payload":"%%%"}"#),
            Err(DecodeError::Payload { .. })
        ));
    }
}
