//! OBD Kiosk Agent - Main Entry Point

use agent::{init_logging, init_metrics, run, AgentConfig};
use std::path::PathBuf;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os("OBD_CONFIG"))
        .map(PathBuf::from);
    let config = AgentConfig::load(path.as_deref())?;

    init_logging(&config.logging)?;
    init_metrics(&config)?;

    info!("=== OBD Kiosk Agent v{} ===", env!("CARGO_PKG_VERSION"));
    if let Some(path) = &path {
        info!("Configuration loaded from {}", path.display());
    }

    run(config).await?;
    Ok(())
}
