use std::net::Ipv4Addr;
use std::sync::Weak;

use bytes::Bytes;
use tokio::net::TcpStream;

use super::{SpliceStats, splice};
use crate::client::ClientInner;
use crate::handshake::ControlMessage;
use crate::sink::{Delivery, PeerSink};
use crate::{Channel, Client, Error, Result};

/// Receives the first frame from peers that have no channel yet.
///
/// The channel for the new peer is created and registered right here, on the
/// receive loop, so the peer's next frame already lands in its inbox. The
/// first payload itself is the session handshake and goes to
/// [`accept_tunnel`] instead.
pub(crate) struct HandshakeInspector {
    client: Weak<ClientInner>,
}

impl HandshakeInspector {
    pub(crate) fn new(client: Weak<ClientInner>) -> Self {
        Self { client }
    }
}

impl PeerSink for HandshakeInspector {
    fn accept(&self, peer_id: &str, payload: Bytes) -> Delivery {
        let Some(client) = Client::upgrade(&self.client) else {
            return Delivery::Accepted;
        };

        if payload.is_empty() {
            tracing::trace!(%peer_id, "End of stream from peer without a channel");
            return Delivery::Accepted;
        }

        let (channel, created) = client.registry().get_or_open(peer_id, client.transport());
        if !created {
            channel.deliver(payload);
            return Delivery::Accepted;
        }

        tracing::debug!(%peer_id, "Inbound channel opened");
        let graceful = client.graceful().clone();
        graceful.spawn(async move {
            if let Err(e) = accept_tunnel(&client, &channel, payload).await {
                let peer_id = channel.peer_id();
                match &e {
                    Error::InvalidHandshake { .. } => {
                        tracing::debug!(%peer_id, error = %e, "Dropped channel")
                    }
                    _ => tracing::warn!(%peer_id, error = %e, "Inbound tunnel failed"),
                }
            }
        });

        Delivery::Accepted
    }
}

/// Serve one inbound session: check the handshake, connect to the local
/// service and splice it with `channel`.
///
/// Every failure closes `channel` (telling the peer first) and leaves the
/// rest of the client alone.
#[tracing::instrument(skip_all, fields(peer_id = %channel.peer_id()))]
pub(crate) async fn accept_tunnel(
    client: &Client,
    channel: &Channel,
    handshake: Bytes,
) -> Result<SpliceStats> {
    let stream = match connect_local(client, channel, &handshake).await {
        Ok(stream) => stream,
        Err(e) => {
            let _ = channel.finish().await;
            channel.close();
            return Err(e);
        }
    };

    tracing::info!("Inbound tunnel established");
    let stats = splice(stream, channel).await?;
    tracing::info!(sent = stats.sent, received = stats.received, "Inbound tunnel ended");
    Ok(stats)
}

async fn connect_local(client: &Client, channel: &Channel, handshake: &[u8]) -> Result<TcpStream> {
    let port = ControlMessage::parse(handshake)?.port();

    if !client.tunnel_allowed(channel.peer_id(), port) {
        return Err(Error::TunnelRefused {
            peer_id: channel.peer_id().to_string(),
            port,
        });
    }

    tokio::select! {
        _ = client.graceful().cancelled() => Err(Error::ConnectionClosed),
        connected = TcpStream::connect((Ipv4Addr::LOCALHOST, port)) => {
            connected.map_err(|source| Error::LocalServiceUnreachable { port, source })
        }
    }
}
