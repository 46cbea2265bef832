use super::{client_config, descriptor, log_events};
use crate::{ServiceArgs, SessionArgs};
use anyhow::{Context, Result};
use dubbo_registry::{RegistryClient, RegistryConfig};
use tracing::warn;

pub async fn run(config: RegistryConfig, session: SessionArgs, service: ServiceArgs) -> Result<()> {
    let client = RegistryClient::new(client_config(&config, session)?)
        .await
        .context("Failed to create registry client")?;
    let events = smol::spawn(log_events(client.events()));

    if let Err(error) = client.ready().await {
        warn!("Initial login failed: {}", error);
    }

    let descriptor = descriptor(service);
    let name = descriptor.path();
    client
        .subscribe(&descriptor, move |urls: &[String]| {
            println!("{} providers of {}", urls.len(), name);
            for url in urls {
                println!("  {}", url);
            }
        })
        .await
        .with_context(|| format!("Failed to subscribe to {}", descriptor.path()))?;

    events.await;
    Ok(())
}
