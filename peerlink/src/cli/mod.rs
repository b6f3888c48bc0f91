//! Command line plumbing shared by all subcommands

use std::path::PathBuf;

use peerlink::Config;

pub mod serve;
pub mod tunnel;

#[derive(clap::Args)]
pub struct GlobalArgs {
    /// Relay access token
    #[arg(long, global = true, env = "PEERLINK_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Relay region
    #[arg(long, global = true, env = "PEERLINK_REGION")]
    pub region: Option<String>,

    /// Full relay URL, overrides --region
    #[arg(long, global = true, env = "PEERLINK_RELAY_URL")]
    pub relay_url: Option<String>,

    /// Skip TLS certificate verification of the relay
    #[arg(long, global = true)]
    pub insecure: bool,

    /// Config file (defaults to ~/.peerlink/config.json)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,
}

/// Config file, then environment, then flags.
pub async fn load_config(args: &GlobalArgs) -> eyre::Result<Config> {
    let config = match &args.config {
        Some(path) => Config::load(path).await?,
        None => match Config::default_path() {
            Some(path) if tokio::fs::try_exists(&path).await.unwrap_or(false) => {
                tracing::debug!(path = %path.display(), "Loading config");
                Config::load(&path).await?
            }
            _ => Config::default(),
        },
    };

    let mut config = config.with_env();
    if let Some(token) = &args.token {
        config.token = token.clone();
    }
    if let Some(region) = &args.region {
        config.region = region.clone();
    }
    if let Some(url) = &args.relay_url {
        config.relay_url = Some(url.clone());
    }
    if args.insecure {
        config.insecure_skip_verify = true;
    }

    config.validate()?;
    tracing::debug!(?config, "Configuration loaded");
    Ok(config)
}
