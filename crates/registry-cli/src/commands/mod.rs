pub mod publish;
pub mod server;
pub mod subscribe;

use crate::{ServiceArgs, SessionArgs};
use anyhow::{Context, Result};
use dubbo_registry::{ClientConfig, ClientEvent, RegistryConfig, ServiceDescriptor};
use std::path::Path;
use tracing::{info, warn};

/// Load the configuration file, or defaults when none is given
pub async fn load_config(path: Option<&Path>) -> Result<RegistryConfig> {
    match path {
        Some(path) => RegistryConfig::from_file(path)
            .await
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Ok(RegistryConfig::default()),
    }
}

/// Client settings from the configuration file with command-line overrides applied
pub fn client_config(config: &RegistryConfig, session: SessionArgs) -> Result<ClientConfig> {
    let mut client = match (session.registry.as_deref(), config.client.clone()) {
        (Some(registry), Some(mut client)) => {
            client.registries = ClientConfig::new(registry, "").registries;
            client
        }
        (Some(registry), None) => ClientConfig::new(registry, session.app.clone()),
        (None, Some(client)) => client,
        (None, None) => anyhow::bail!("No registry address: pass --registry or a configuration file"),
    };
    if client.app_name.is_empty() {
        client.app_name = session.app;
    }
    if let Some(dir) = session.cache_dir {
        client = client.with_local_cache_dir(dir);
    }
    Ok(client)
}

/// Descriptor for the service named on the command line
pub fn descriptor(service: ServiceArgs) -> ServiceDescriptor {
    let descriptor = ServiceDescriptor::new(service.interface, service.service_version);
    match service.group {
        Some(group) => descriptor.with_group(group),
        None => descriptor,
    }
}

/// Log session events until the client is closed
pub async fn log_events(events: async_channel::Receiver<ClientEvent>) {
    while let Ok(event) = events.recv().await {
        match event {
            ClientEvent::LoggedIn(address) => info!("Logged in to registry {}", address),
            ClientEvent::Error(error) => warn!("Registry session error: {}", error),
        }
    }
}
