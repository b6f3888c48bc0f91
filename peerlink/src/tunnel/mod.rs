//! TCP tunnels over channels.
//!
//! An outbound tunnel listens on a local port and forwards each accepted
//! connection to a port on the remote peer. The remote side sees a
//! `{"type":"tunnel","port":N}` handshake on a new channel and bridges it to
//! `127.0.0.1:N` (the inbound tunnel). Both directions use [`splice`].

use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

pub(crate) mod inbound;
pub(crate) mod outbound;
mod splice;

pub use splice::{CHUNK_SIZE, SpliceStats, splice};

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TunnelConfig {
    pub remote_peer: String,
    /// Port on the remote peer's loopback interface.
    pub remote_port: u16,
    /// Local port to listen on; 0 picks a free port.
    pub local_port: u16,
}

impl TunnelConfig {
    pub fn new(remote_peer: impl Into<String>, remote_port: u16, local_port: u16) -> Self {
        Self {
            remote_peer: remote_peer.into(),
            remote_port,
            local_port,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.remote_peer.trim().is_empty() {
            return Err(Error::Config("remote peer must not be empty".to_string()));
        }
        if self.remote_port == 0 {
            return Err(Error::Config(
                "remote port must be in 1..=65535".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outbound,
    Inbound,
}

/// One bridged session, or an outbound tunnel's listener.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TunnelDescriptor {
    pub remote_peer_id: String,
    pub remote_port: u16,
    pub local_port: u16,
    pub direction: Direction,
}

/// A running outbound tunnel.
///
/// Dropping the handle leaves the tunnel running until the client closes.
#[derive(Debug)]
pub struct Tunnel {
    descriptor: TunnelDescriptor,
    local_addr: SocketAddr,
    cancel: CancellationToken,
}

impl Tunnel {
    pub(crate) fn new(
        descriptor: TunnelDescriptor,
        local_addr: SocketAddr,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            descriptor,
            local_addr,
            cancel,
        }
    }

    pub fn descriptor(&self) -> &TunnelDescriptor {
        &self.descriptor
    }

    /// Address local applications connect to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting local connections. Sessions already running end when
    /// either side closes.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the tunnel stops listening.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }
}
