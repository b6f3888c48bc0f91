//! Tunnel handshake.
//!
//! The first payload on a freshly opened channel is a control message, not
//! tunnel data. It names the local port on the receiving side the tunnel
//! should be bridged to:
//!
//! ```text
//! {"type":"tunnel","port":9000}
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Control message sent as the first payload of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Bridge this channel to `127.0.0.1:port` on the receiving side
    Tunnel { port: u16 },
}

impl ControlMessage {
    pub fn tunnel(port: u16) -> Self {
        Self::Tunnel { port }
    }

    pub fn encode(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| Error::Send {
                source: eyre::Error::from(e),
            })
    }

    pub fn parse(payload: &[u8]) -> Result<Self> {
        let message: Self =
            serde_json::from_slice(payload).map_err(|e| Error::InvalidHandshake {
                reason: e.to_string(),
            })?;

        match message {
            Self::Tunnel { port: 0 } => Err(Error::InvalidHandshake {
                reason: "port 0 can't be tunnelled".to_string(),
            }),
            message => Ok(message),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Self::Tunnel { port } => *port,
        }
    }
}
