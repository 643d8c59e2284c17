//! codecast-server: standalone relay process.
//!
//! Configuration comes from the environment:
//! - `CODECAST_BIND_ADDR` (default `127.0.0.1:5000`)
//! - `CODECAST_MAX_MESSAGE_BYTES` (default 1 MiB)
//! - `CODECAST_OUTBOX_CAPACITY` (default 256 events per connection)
//! - `RUST_LOG` for log filtering

use log::{error, info};

use codecast_relay::server::{RelayServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = ServerConfig::from_env();
    info!("Starting CodeCast relay on {}", config.bind_addr);

    let server = RelayServer::new(config);
    let relay = server.relay().clone();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, shutting down");
                relay.shutdown();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {e}"),
        }
    });

    server.run().await?;
    info!("CodeCast relay stopped");
    Ok(())
}
