//! The peerlink client
//!
//! A [`Client`] owns one relay connection, the channels multiplexed over it
//! and the tunnels built on those channels.
//!
//! ## Channels
//!
//! Use [`Client::connect`] to get the channel for a peer:
//!
//! ```rust,no_run
//! # async fn example() -> peerlink::Result<()> {
//! let client = peerlink::Client::new(peerlink::Config::new("token")).await?;
//!
//! let channel = client.connect("bob").await?;
//! channel.write("ping").await?;
//! let reply = channel.read().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Tunnels
//!
//! Expose bob's port 22 on a local port:
//!
//! ```rust,no_run
//! # async fn example(client: peerlink::Client) -> peerlink::Result<()> {
//! let tunnel = client
//!     .create_tunnel(peerlink::TunnelConfig::new("bob", 22, 2222))
//!     .await?;
//! println!("ssh -p {} localhost", tunnel.local_addr().port());
//! tunnel.closed().await;
//! # Ok(())
//! # }
//! ```
//!
//! Inbound tunnels need nothing beyond a connected client: a peer opening a
//! channel with a tunnel handshake is bridged to the requested local port
//! if [`Config::allowed_ports`] and the [`Client::with_tunnel_auth`] hook
//! allow it.

use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use peerlink_net::Dialer;

use crate::coordination::Graceful;
use crate::registry::ChannelRegistry;
use crate::transport::{ConnectionState, Transport};
use crate::tunnel::inbound::HandshakeInspector;
use crate::tunnel::{Tunnel, TunnelConfig};
use crate::{Channel, Config, Result};

/// Upper bound on telling peers goodbye during [`Client::close`].
const FINISH_TIMEOUT: Duration = Duration::from_secs(1);

type TunnelAuth = dyn Fn(&str, u16) -> bool + Send + Sync;

/// Cloning a client yields another handle to the same connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    config: Config,
    graceful: Graceful,
    transport: Arc<Transport>,
    registry: Arc<ChannelRegistry>,
    tunnel_auth: RwLock<Option<Arc<TunnelAuth>>>,
}

impl Client {
    /// Client for the relay described by `config`.
    ///
    /// Nothing is dialed until [`Client::connect`] or [`Client::listen`].
    pub async fn new(config: Config) -> Result<Self> {
        let dialer = config.dialer().await?;
        Ok(Self::with_dialer(config, dialer))
    }

    /// Client using a custom [`Dialer`], e.g. a
    /// [`MemoryRelay`](peerlink_net::MemoryRelay) endpoint.
    pub fn with_dialer(config: Config, dialer: impl Dialer) -> Self {
        let graceful = Graceful::new();
        let transport = Transport::new(Arc::new(dialer), graceful.clone());
        let inner = Arc::new(ClientInner {
            config,
            graceful,
            transport,
            registry: ChannelRegistry::new(),
            tunnel_auth: RwLock::new(None),
        });

        inner
            .transport
            .set_unmatched(Arc::new(HandshakeInspector::new(Arc::downgrade(&inner))));

        Self { inner }
    }

    /// Decide per peer and port whether an inbound tunnel is accepted.
    ///
    /// Checked after [`Config::allowed_ports`].
    ///
    /// # Example
    /// ```rust,no_run
    /// # fn example(client: peerlink::Client) {
    /// let client = client.with_tunnel_auth(|peer, port| peer == "bob" && port == 8080);
    /// # }
    /// ```
    pub fn with_tunnel_auth<F>(self, auth_fn: F) -> Self
    where
        F: Fn(&str, u16) -> bool + Send + Sync + 'static,
    {
        *self
            .inner
            .tunnel_auth
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(auth_fn));
        self
    }

    pub(crate) fn upgrade(inner: &Weak<ClientInner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.inner.transport
    }

    pub(crate) fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.inner.registry
    }

    pub(crate) fn graceful(&self) -> &Graceful {
        &self.inner.graceful
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.transport.state()
    }

    /// Channel to `peer_id`, connecting to the relay first if needed.
    ///
    /// Returns the existing channel when one is live: concurrent calls for
    /// the same peer get the same channel.
    #[tracing::instrument(skip(self))]
    pub async fn connect(&self, peer_id: &str) -> Result<Channel> {
        self.inner.transport.connect().await?;

        let (channel, created) = self
            .inner
            .registry
            .get_or_open(peer_id, &self.inner.transport);
        if created {
            tracing::debug!("Opened channel");
        }
        Ok(channel)
    }

    /// Connect to the relay without opening any channel.
    pub async fn listen(&self) -> Result<()> {
        self.inner.transport.connect().await
    }

    /// Connect and accept inbound tunnels until the relay connection ends.
    pub async fn serve(&self) -> Result<()> {
        self.listen().await?;
        tracing::info!("Serving inbound tunnels");
        self.inner.transport.closed().await;
        Ok(())
    }

    /// The live channel for `peer_id`, if any.
    pub fn channel(&self, peer_id: &str) -> Option<Channel> {
        self.inner.registry.get(peer_id)
    }

    /// Peers with a live channel.
    pub fn peers(&self) -> Vec<String> {
        self.inner.registry.peers()
    }

    pub async fn create_tunnel(&self, config: TunnelConfig) -> Result<Tunnel> {
        crate::tunnel::outbound::open(self, config).await
    }

    pub(crate) fn tunnel_allowed(&self, peer_id: &str, port: u16) -> bool {
        if !self.inner.config.port_allowed(port) {
            return false;
        }
        let auth = self
            .inner
            .tunnel_auth
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        auth.is_none_or(|auth| auth(peer_id, port))
    }

    /// Finish every channel, close the relay connection and wait for all
    /// background tasks. The client can't be reconnected afterwards.
    pub async fn close(&self) {
        let finishing = async {
            for channel in self.inner.registry.channels() {
                if channel.is_connected() {
                    let _ = channel.finish().await;
                }
            }
        };
        if tokio::time::timeout(FINISH_TIMEOUT, finishing).await.is_err() {
            tracing::debug!("Timed out finishing channels");
        }

        self.inner.transport.close().await;
        self.inner.registry.close_all();
        self.inner.graceful.shutdown().await;
        tracing::info!("Client closed");
    }
}
