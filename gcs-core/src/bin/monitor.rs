//! Membership and heartbeat monitor binary

use gcs_core::id::{ClientId, JobId};
use gcs_core::{AsyncGcsClient, GcsClientConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting GCS monitor");

    let config = GcsClientConfig::from_env()?;
    info!("Connecting to GCS at {}:{}", config.address, config.port);
    let client = match AsyncGcsClient::connect(config).await {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to connect to GCS: {}", e);
            return Err(e.into());
        }
    };

    // Observe without joining: the monitor is not a cluster member
    let membership_log = client.client_table().log();
    let mut members = membership_log.subscribe(JobId::nil(), ClientId::nil())?;
    let mut heartbeats = client.heartbeat_table().subscribe(JobId::nil(), ClientId::nil())?;
    members.acknowledged().await?;
    heartbeats.acknowledged().await?;

    let history = membership_log.lookup(JobId::nil(), ClientId::nil())?.await?;
    info!("Membership log holds {} records", history.len());
    for record in history {
        info!(
            "  {} {} at {}:{}",
            record.client_id,
            if record.is_insertion { "joined" } else { "left" },
            record.node_manager_address,
            record.node_manager_port
        );
    }

    loop {
        tokio::select! {
            Some(n) = members.next() => {
                if n.data.is_insertion {
                    info!("Client {} joined at {}:{}", n.data.client_id, n.data.node_manager_address, n.data.node_manager_port);
                } else {
                    info!("Client {} left", n.data.client_id);
                }
            }
            Some(n) = heartbeats.next() => {
                for (label, capacity) in &n.data.resources {
                    info!("Heartbeat {} {}: {}/{}", n.id, label, capacity.available, capacity.total);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down monitor");
                break;
            }
        }
    }

    client.shutdown();
    info!("{}", gcs_core::metrics::gather_client_metrics());
    Ok(())
}
