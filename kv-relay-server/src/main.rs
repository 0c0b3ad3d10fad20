use kv_relay::{RelayConfig, RelayServer};
use log::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = RelayConfig::from_env()?;
    // RUST_LOG, when set, refines the LOG_LEVEL default.
    env_logger::Builder::new()
        .filter_level(config.log_level)
        .parse_default_env()
        .init();

    info!("Starting kv-relay...");

    let server = RelayServer::open(config)?;
    server.run().await
}
