//! # peerlink
//!
//! Per-peer virtual connections and TCP tunnels for endpoints that can't
//! reach each other directly.
//!
//! Every endpoint keeps one connection to a shared relay. Traffic for all of
//! its peers is multiplexed over that connection as peer-tagged frames and
//! split back out into one [`Channel`] per peer. A tunnel splices a channel
//! with a local TCP socket, so a service on one side shows up as a local
//! port on the other.
//!
//! ## Architecture
//!
//! ```text
//!  local app ─TCP─► Tunnel ─► Channel ─► Transport ══ relay ══ Transport ─► Channel ─► Tunnel ─TCP─► service
//! ```
//!
//! - [`Transport`]: the relay connection; frames, routes, owns nothing else
//! - [`Channel`]: one ordered byte stream to one peer
//! - [`Client`]: the channel registry, inbound handshake handling and tunnels
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn example() -> peerlink::Result<()> {
//! let config = peerlink::Config::new("relay-token").with_env();
//! let client = peerlink::Client::new(config).await?;
//!
//! // Accept inbound tunnels from peers until the relay goes away.
//! client.serve().await?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod client;
pub mod config;
pub mod coordination;
pub mod error;
pub mod handshake;
pub mod registry;
pub mod sink;
pub mod transport;
pub mod tunnel;

pub use channel::{Channel, ChannelMetrics};
pub use client::Client;
pub use config::Config;
pub use error::{Error, Result};
pub use handshake::ControlMessage;
pub use sink::{Delivery, PeerSink};
pub use transport::{ConnectionState, HandlerId, Transport};
pub use tunnel::{Direction, SpliceStats, Tunnel, TunnelConfig, TunnelDescriptor, splice};

// Re-exported so users don't need a direct peerlink-net dependency.
pub use peerlink_net::{Dialer, MemoryRelay, WsDialer};
