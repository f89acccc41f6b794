use anyhow::Result;
use game_relay::{CONFIG_FILE, ProxyCore, TcpDialer, load_config};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = load_config()?;
    if config.control_plane.enabled && config.ensure_control_key() {
        warn!(
            key = %config.control_plane.key,
            "No control plane key configured, generated one for this run"
        );
    }
    info!(
        config_file = CONFIG_FILE,
        listen_addr = %config.listen_address(),
        hub = %config.hub_address(),
        control_plane = config.control_plane.enabled,
        "Configuration loaded"
    );

    let dialer = Arc::new(TcpDialer::new(config.handshake_timeout()));
    ProxyCore::new(config, dialer).run().await
}
