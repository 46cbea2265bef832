use anyhow::{Context, Result};
use dubbo_registry::{RegistryConfig, RegistryServer};
use tracing::info;

pub async fn run(config: RegistryConfig, listen: Option<String>, sync: Vec<String>) -> Result<()> {
    let mut server_config = config.server.unwrap_or_default();
    if let Some(listen) = listen {
        server_config.listen_addr = listen;
    }
    if !sync.is_empty() {
        server_config.sync_registries = sync;
    }

    let server = RegistryServer::bind(server_config.clone())
        .await
        .with_context(|| format!("Failed to bind {}", server_config.listen_addr))?;

    info!("Registry server listening on {}", server.local_addr());
    if !server_config.sync_registries.is_empty() {
        info!("Advertising sync registries: {}", server_config.sync_registries.join(","));
    }
    println!("Registry server listening on {}", server.local_addr());

    // Serve until the process is killed
    std::future::pending::<()>().await;
    server.close().await;
    Ok(())
}
