use peerlink::{Client, Config, TunnelConfig};

pub async fn run(config: Config, tunnel: TunnelConfig) -> eyre::Result<()> {
    tunnel.validate()?;

    let client = Client::new(config).await?;
    let tunnel = client.create_tunnel(tunnel).await?;
    let descriptor = tunnel.descriptor();
    println!(
        "Forwarding {} -> {}:{}",
        tunnel.local_addr(),
        descriptor.remote_peer_id,
        descriptor.remote_port
    );

    let result = tokio::select! {
        _ = tunnel.closed() => Ok(()),
        _ = client.transport().closed() => Err(eyre::eyre!("relay connection lost")),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting down");
            Ok(())
        }
    };

    tunnel.close();
    client.close().await;
    result
}
