use peerlink::{Client, Config};

pub async fn run(mut config: Config, allow_ports: Vec<u16>) -> eyre::Result<()> {
    if !allow_ports.is_empty() {
        config.allowed_ports = allow_ports;
        config.validate()?;
    }

    let client = Client::new(config).await?;
    client.listen().await?;
    println!("Connected to {}", client.config().endpoint());

    let result = tokio::select! {
        served = client.serve() => match served {
            Ok(()) => Err(eyre::eyre!("relay connection lost")),
            Err(e) => Err(e.into()),
        },
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting down");
            Ok(())
        }
    };

    client.close().await;
    result
}
