#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use hubd::config::{Args, HubConfig};
use hubd::metrics::{start_metrics_server, HealthState};
use hubd::Hub;
use std::time::Duration;
use tracing::{info, warn};

const STOP_DEADLINE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config: HubConfig = args.into();
    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    let metrics_addr = config.metrics_addr;
    let health_state = HealthState::new();
    tokio::spawn({
        let health_state = health_state.clone();
        async move {
            if let Err(e) = start_metrics_server(metrics_addr, health_state).await {
                warn!("metrics server error: {}", e);
            }
        }
    });

    let hub = Hub::new(config)?;
    let addr = hub.start().await?;
    info!("hub bound to {}", addr);

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal");
    health_state.set_ready(false);

    if let Err(e) = hub.stop(STOP_DEADLINE).await {
        warn!("shutdown incomplete: {}", e);
    }
    info!("hub stopped");
    Ok(())
}
