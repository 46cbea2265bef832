//! Registry server

use crate::{
    config::ServerConfig,
    connection::{Outbound, PeerMap, ServerConnection},
    error::Result,
    registry::Registry,
};
use async_net::TcpListener;
use futures::lock::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Accepts registry connections and serves them against one [`Registry`]
pub struct RegistryServer {
    local_addr: SocketAddr,
    registry: Arc<Registry>,
    peers: PeerMap,
    shutdown: async_channel::Sender<()>,
    accept_task: Mutex<Option<smol::Task<()>>>,
}

impl RegistryServer {
    /// Bind the listen address and start accepting
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr.as_str()).await?;
        let local_addr = listener.local_addr()?;
        info!("Registry server listening on {}", local_addr);
        if !config.sync_registries.is_empty() {
            info!("Advertising sync registries {:?}", config.sync_registries);
        }

        let registry = Arc::new(Registry::new());
        let peers: PeerMap = Arc::new(Mutex::new(HashMap::new()));
        let (shutdown, shutdown_rx) = async_channel::bounded(1);

        let task = smol::spawn(accept_loop(
            listener,
            registry.clone(),
            peers.clone(),
            Arc::new(config.sync_registries),
            shutdown_rx,
        ));

        Ok(Self {
            local_addr,
            registry,
            peers,
            shutdown,
            accept_task: Mutex::new(Some(task)),
        })
    }

    /// Bound address, useful when listening on port 0
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Registration tables
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Number of live connections
    pub async fn connection_count(&self) -> usize {
        self.peers.lock().await.len()
    }

    /// Stop accepting and close every live connection
    pub async fn close(&self) {
        self.shutdown.close();
        if let Some(task) = self.accept_task.lock().await.take() {
            task.await;
        }

        let peers = self.peers.lock().await;
        for (addr, tx) in peers.iter() {
            debug!("Closing connection to {}", addr);
            let _ = tx.unbounded_send(Outbound::Close);
        }
        info!("Registry server on {} closed ({} connections)", self.local_addr, peers.len());
    }
}

async fn accept_loop(
    listener: TcpListener,
    registry: Arc<Registry>,
    peers: PeerMap,
    sync_registries: Arc<Vec<String>>,
    shutdown: async_channel::Receiver<()>,
) {
    loop {
        let accepted = smol::future::or(async { Some(listener.accept().await) }, async {
            let _ = shutdown.recv().await;
            None
        })
        .await;

        let (stream, addr) = match accepted {
            Some(Ok(accepted)) => accepted,
            Some(Err(e)) => {
                error!("Failed to accept connection: {}", e);
                continue;
            }
            None => break,
        };

        let registry = registry.clone();
        let peers = peers.clone();
        let sync_registries = sync_registries.clone();
        smol::spawn(async move {
            let connection =
                match ServerConnection::accept(stream, addr, registry, peers, sync_registries).await {
                    Ok(connection) => connection,
                    Err(e) => {
                        warn!("Handshake with {} failed: {}", addr, e);
                        return;
                    }
                };
            if let Err(e) = connection.handle().await {
                warn!("Connection from {} ended with error: {}", addr, e);
            }
        })
        .detach();
    }

    info!("Stopped accepting registry connections");
}
