use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::{Direction, Tunnel, TunnelConfig, TunnelDescriptor, splice};
use crate::handshake::ControlMessage;
use crate::{Channel, Client, Error, Result};

/// Start an outbound tunnel.
///
/// The first session's channel is opened and handshaken before the local
/// listener starts, so connection problems surface here rather than on the
/// first local connection.
#[tracing::instrument(skip(client), fields(peer_id = %config.remote_peer))]
pub(crate) async fn open(client: &Client, config: TunnelConfig) -> Result<Tunnel> {
    config.validate()?;

    let mut descriptor = TunnelDescriptor {
        remote_peer_id: config.remote_peer.clone(),
        remote_port: config.remote_port,
        local_port: config.local_port,
        direction: Direction::Outbound,
    };

    let channel = open_session(client, &descriptor).await?;

    let listener = match TcpListener::bind((Ipv4Addr::LOCALHOST, config.local_port)).await {
        Ok(listener) => listener,
        Err(e) => {
            let _ = channel.finish().await;
            channel.close();
            return Err(Error::Io { source: e });
        }
    };
    let local_addr = listener.local_addr()?;
    descriptor.local_port = local_addr.port();

    tracing::info!(
        %local_addr,
        remote_port = descriptor.remote_port,
        "Outbound tunnel listening"
    );

    let cancel = client.graceful().child_token();
    client.graceful().spawn(accept_loop(
        client.clone(),
        listener,
        descriptor.clone(),
        channel,
        cancel.clone(),
    ));

    Ok(Tunnel::new(descriptor, local_addr, cancel))
}

/// Open a fresh channel to the remote peer and send the tunnel handshake.
async fn open_session(client: &Client, descriptor: &TunnelDescriptor) -> Result<Channel> {
    // The peer's one channel is already carrying something else.
    if client.channel(&descriptor.remote_peer_id).is_some() {
        return Err(Error::TunnelBusy);
    }

    let channel = client.connect(&descriptor.remote_peer_id).await?;
    let handshake = ControlMessage::tunnel(descriptor.remote_port).encode()?;
    if let Err(e) = channel.write(handshake).await {
        channel.close();
        return Err(e);
    }

    tracing::debug!(
        peer_id = %descriptor.remote_peer_id,
        remote_port = descriptor.remote_port,
        "Tunnel handshake sent"
    );
    Ok(channel)
}

/// Accept local connections and splice each one with its own session.
///
/// One local connection is served at a time. Connections arriving while a
/// session is active are refused.
async fn accept_loop(
    client: Client,
    listener: TcpListener,
    descriptor: TunnelDescriptor,
    first: Channel,
    cancel: CancellationToken,
) {
    let active = Arc::new(Semaphore::new(1));
    let mut primed = Some(first);

    loop {
        let (stream, addr) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept local connection");
                    continue;
                }
            },
        };

        let Ok(permit) = active.clone().try_acquire_owned() else {
            let e = Error::TunnelBusy;
            tracing::warn!(%addr, error = %e, "Refusing local connection");
            continue;
        };

        let reusable = match primed.take() {
            Some(channel) if channel.is_connected() => Some(channel),
            Some(stale) => {
                // finished by the peer before any local connection arrived
                stale.close();
                None
            }
            None => None,
        };
        let channel = match reusable {
            Some(channel) => channel,
            None => match open_session(&client, &descriptor).await {
                Ok(channel) => channel,
                Err(e) => {
                    tracing::warn!(%addr, error = %e, "Failed to open tunnel session");
                    continue;
                }
            },
        };

        tracing::info!(%addr, peer_id = %descriptor.remote_peer_id, "Local connection accepted");

        let peer_id = descriptor.remote_peer_id.clone();
        client.graceful().spawn(async move {
            let _permit = permit;
            match splice(stream, &channel).await {
                Ok(stats) => tracing::info!(
                    %peer_id,
                    sent = stats.sent,
                    received = stats.received,
                    "Tunnel session ended"
                ),
                Err(e) => tracing::warn!(%peer_id, error = %e, "Tunnel session failed"),
            }
        });
    }

    if let Some(channel) = primed {
        let _ = channel.finish().await;
        channel.close();
    }
    tracing::info!(local_port = descriptor.local_port, "Outbound tunnel stopped");
}
