use super::{client_config, descriptor, log_events};
use crate::{ServiceArgs, SessionArgs};
use anyhow::{Context, Result};
use dubbo_registry::{RegistryClient, RegistryConfig};
use tracing::{info, warn};

pub async fn run(
    config: RegistryConfig,
    session: SessionArgs,
    service: ServiceArgs,
    url: String,
) -> Result<()> {
    let client = RegistryClient::new(client_config(&config, session)?)
        .await
        .context("Failed to create registry client")?;
    let events = smol::spawn(log_events(client.events()));

    // The session keeps reconnecting in the background when this fails
    if let Err(error) = client.ready().await {
        warn!("Initial login failed: {}", error);
    }

    let descriptor = descriptor(service).with_url(url.clone());
    client
        .publish(&descriptor)
        .await
        .with_context(|| format!("Failed to publish {}", url))?;
    info!("Published {} for {}", url, descriptor.path());
    println!("Published {}", url);

    // The registration lives as long as the session
    events.await;
    Ok(())
}
