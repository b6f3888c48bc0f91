//! # peerlink-net
//!
//! Network plumbing for peerlink: the relay wire protocol, credential
//! handling, relay endpoint resolution and the socket abstraction the
//! transport runs on.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   FrameSink / FrameSource   ┌───────────┐
//! │  transport   │◄───────────────────────────►│  Dialer   │──► relay
//! └──────────────┘                             └───────────┘
//!                                               WsDialer | MemoryRelay
//! ```
//!
//! A [`Dialer`] opens one physical connection to the relay and hands back a
//! pair of text-message halves. Everything above that only deals with
//! [`Frame`]s.

pub mod credential;
pub mod endpoint;
pub mod memory;
pub mod protocol;
pub mod socket;
pub mod tls;

pub use credential::{Credential, CredentialError};
pub use endpoint::{DEFAULT_RELAY_DOMAIN, RelayEndpoint, WsDialer};
pub use memory::{MemoryDialer, MemoryRelay};
pub use protocol::{DecodeError, FRAME_TYPE_P2P, Frame, Incoming, decode};
pub use socket::{Dialer, FrameSink, FrameSource, SocketError};
