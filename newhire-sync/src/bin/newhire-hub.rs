//! Standalone push hub.
//!
//! Usage: `newhire-hub [bind-addr]` (default `127.0.0.1:9090`).
//! Log level follows `RUST_LOG`, defaulting to `info`.

use newhire_sync::hub::{HubConfig, PushHub};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let bind_addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| HubConfig::default().bind_addr);
    let hub = PushHub::new(HubConfig {
        bind_addr,
        ..HubConfig::default()
    });

    tokio::select! {
        served = hub.run() => served?,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Interrupted, shutting down");
            hub.shutdown();
        }
    }
    Ok(())
}
