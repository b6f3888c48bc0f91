//! Error types for peerlink

/// Errors surfaced by the transport, channels and tunnels.
///
/// Failures local to one channel or tunnel session never affect the shared
/// relay connection or other channels.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to connect to relay: {source}")]
    ConnectFailure {
        #[source]
        source: peerlink_net::SocketError,
    },

    #[error("not connected to relay")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("malformed frame: {source}")]
    DecodeFailure {
        #[from]
        source: peerlink_net::DecodeError,
    },

    #[error("local service on port {port} is unreachable: {source}")]
    LocalServiceUnreachable {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid tunnel handshake: {reason}")]
    InvalidHandshake { reason: String },

    #[error("tunnel to port {port} refused for peer {peer_id}")]
    TunnelRefused { peer_id: String, port: u16 },

    #[error("a local connection is already using this tunnel")]
    TunnelBusy,

    #[error("failed to send frame: {source}")]
    Send { source: eyre::Error },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
