use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;
use tracing::info;

use keywarden_bridge::{Bootstrap, BootstrapPayload, Supervisor};
use keywarden_core::{LogPrompt, NullAuthority, SelectedKey};

#[derive(Debug, Deserialize)]
struct Config {
    bootstrap: BootstrapPayload,
    #[serde(default)]
    keys: Vec<SelectedKey>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = load_config()?;
    let bootstrap = Bootstrap::from_payload(config.bootstrap)
        .context("bootstrap payload is incomplete, refusing to connect")?;

    // The real custodian binding plugs in here; NullAuthority exposes no keys.
    let supervisor = Supervisor::new(Arc::new(NullAuthority), Arc::new(LogPrompt));
    supervisor.start(bootstrap, config.keys);

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    supervisor.stop_all().await;
    Ok(())
}

fn load_config() -> anyhow::Result<Config> {
    let path = std::env::var("KEYWARDEN_CONFIG").context("KEYWARDEN_CONFIG is not set")?;
    load_config_from(Path::new(&path))
}

fn load_config_from(path: &Path) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
}
