//! Server side of a registry connection

use crate::{
    codec::{self, Packet, Status},
    error::{Error, Result},
    protocol::{
        DUBBO_VERSION, LoginInfo, NotifyPayload, RegistryReply, RegistryRequest, UrlPayload,
    },
    registry::{Notifications, Registry},
    url::ServiceUrl,
};
use async_net::TcpStream;
use async_tungstenite::{WebSocketStream, accept_async};
use futures::channel::mpsc;
use futures::lock::Mutex;
use futures::stream::SplitSink;
use futures::{FutureExt, SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tungstenite::Message;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Outbound queues of every live connection, keyed by peer address
pub type PeerMap = Arc<Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<Outbound>>>>;

/// Work queued for a connection by someone other than its own peer
#[derive(Debug)]
pub enum Outbound {
    /// Push a packet to the peer
    Packet(Packet),
    /// Close the connection
    Close,
}

/// One accepted client connection
pub struct ServerConnection {
    ws: WebSocketStream<TcpStream>,
    addr: SocketAddr,
    registry: Arc<Registry>,
    peers: PeerMap,
    sync_registries: Arc<Vec<String>>,
}

/// Per-peer state owned by the handler loop
struct PeerState {
    addr: SocketAddr,
    registry: Arc<Registry>,
    sync_registries: Arc<Vec<String>>,
    login: Option<LoginInfo>,
    service_keys: HashSet<String>,
}

impl ServerConnection {
    /// Complete the WebSocket handshake for an accepted socket
    pub async fn accept(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<Registry>,
        peers: PeerMap,
        sync_registries: Arc<Vec<String>>,
    ) -> Result<Self> {
        let ws = accept_async(stream).await?;
        debug!("New registry connection from {}", addr);
        Ok(Self {
            ws,
            addr,
            registry,
            peers,
            sync_registries,
        })
    }

    /// Peer address, which is also the connection identity
    pub fn peer_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serve the connection until either side closes it
    pub async fn handle(self) -> Result<()> {
        let Self {
            ws,
            addr,
            registry,
            peers,
            sync_registries,
        } = self;
        info!("Handling connection from {}", addr);

        let (tx, mut outbound) = mpsc::unbounded();
        peers.lock().await.insert(addr, tx);

        let (mut sink, mut stream) = StreamExt::split(ws);
        let mut state = PeerState {
            addr,
            registry: registry.clone(),
            sync_registries,
            login: None,
            service_keys: HashSet::new(),
        };
        let mut result = Ok(());

        loop {
            futures::select! {
                item = outbound.next() => match item {
                    Some(Outbound::Packet(packet)) => {
                        if let Err(e) = write(&mut sink, addr, &packet).await {
                            result = Err(e);
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        debug!("Closing connection to {}", addr);
                        let _ = sink.close().await;
                        break;
                    }
                },

                message = stream.next().fuse() => match message {
                    Some(Ok(message)) => match codec::decode(&message, &addr.to_string()) {
                        Ok(Some(packet)) => {
                            let (response, notifications) = state.handle_packet(packet).await;
                            if let Some(response) = response {
                                if let Err(e) = write(&mut sink, addr, &response).await {
                                    result = Err(e);
                                    break;
                                }
                            }
                            deliver(&peers, notifications).await;
                        }
                        Ok(None) => {
                            if let Message::Close(_) = message {
                                debug!("Client {} closing connection", addr);
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("{}", e);
                            result = Err(e);
                            break;
                        }
                    },
                    Some(Err(e)) => {
                        error!("WebSocket error from {}: {}", addr, e);
                        break;
                    }
                    None => break,
                },
            }
        }

        peers.lock().await.remove(&addr);
        let notifications = registry.remove_connection(addr, &state.service_keys).await;
        deliver(&peers, notifications).await;

        let application = state
            .login
            .as_ref()
            .and_then(|login| login.application.as_deref())
            .unwrap_or("unknown");
        info!("Connection from {} ({}) closed", addr, application);
        result
    }
}

impl PeerState {
    /// Produce the response to send back, plus pushes for other peers
    async fn handle_packet(&mut self, packet: Packet) -> (Option<Packet>, Notifications) {
        if packet.is_heartbeat() {
            return if packet.is_response() {
                (None, Vec::new())
            } else {
                (Some(Packet::heartbeat_response(packet.id())), Vec::new())
            };
        }

        let (id, two_way, data) = match packet {
            Packet::Request {
                id, two_way, data, ..
            } => (id, two_way, data),
            Packet::Response { id, .. } => {
                debug!("Ignoring response #{} from {}", id, self.addr);
                return (None, Vec::new());
            }
        };

        let outcome = match data {
            Some(data) => match serde_json::from_value::<RegistryRequest>(data) {
                Ok(request) => self.dispatch(request).await,
                Err(e) => Err(Error::Json(e)),
            },
            None => Err(Error::RequestFailed("empty request".to_string())),
        };

        match outcome {
            Ok((reply, notifications)) => {
                let response = match serde_json::to_value(&reply) {
                    Ok(data) => Packet::ok(id, data),
                    Err(e) => Packet::failure(id, Status::ServerError, e.to_string()),
                };
                (two_way.then_some(response), notifications)
            }
            Err(e) => {
                warn!("Request #{} from {} failed: {}", id, self.addr, e);
                (
                    two_way.then(|| Packet::failure(id, Status::ClientError, e.to_string())),
                    Vec::new(),
                )
            }
        }
    }

    async fn dispatch(&mut self, request: RegistryRequest) -> Result<(RegistryReply, Notifications)> {
        debug!("{} request from {}", request.kind(), self.addr);

        match request {
            RegistryRequest::Login(info) => {
                info!(
                    "{} logged in (application: {:?}, user: {:?})",
                    self.addr, info.application, info.username
                );
                self.login = Some(info);
                let reply = RegistryReply {
                    protocol_version: Some(DUBBO_VERSION.to_string()),
                    sync: (!self.sync_registries.is_empty())
                        .then(|| self.sync_registries.to_vec()),
                    ..RegistryReply::ok()
                };
                Ok((reply, Vec::new()))
            }
            RegistryRequest::Register(url) => {
                // Not always acknowledged: a URL without a service key gets a
                // client error instead of `{status: "ok"}`
                let url = self.owned_url(&url)?;
                let notifications = self.registry.register(self.addr, &url).await?;
                Ok((RegistryReply::ok(), notifications))
            }
            RegistryRequest::Unregister(url) => {
                let url = parse_url(&url)?;
                let notifications = self.registry.unregister(self.addr, &url).await?;
                Ok((RegistryReply::ok(), notifications))
            }
            RegistryRequest::Subscribe(url) => {
                let url = self.owned_url(&url)?;
                let notify = self.registry.subscribe(self.addr, &url).await?;
                let reply = RegistryReply {
                    notify: Some(NotifyPayload::UrlList(notify)),
                    ..RegistryReply::ok()
                };
                Ok((reply, Vec::new()))
            }
            RegistryRequest::Unsubscribe(url) => {
                let url = parse_url(&url)?;
                self.registry.unsubscribe(self.addr, &url).await?;
                Ok((RegistryReply::ok(), Vec::new()))
            }
        }
    }

    /// Parse `url` and remember its service key for cleanup on close
    fn owned_url(&mut self, url: &UrlPayload) -> Result<ServiceUrl> {
        let url = parse_url(url)?;
        if let Some(key) = url.service_key() {
            self.service_keys.insert(key);
        }
        Ok(url)
    }
}

/// Only full URL strings carry the provider address
fn parse_url(payload: &UrlPayload) -> Result<ServiceUrl> {
    match payload {
        UrlPayload::Full(url) => ServiceUrl::value_of(url),
        UrlPayload::Legacy(_) => Err(Error::RequestFailed(
            "service key maps are not supported, send the full url".to_string(),
        )),
    }
}

async fn write(sink: &mut WsSink, addr: SocketAddr, packet: &Packet) -> Result<()> {
    let frame = codec::encode(packet)?;
    sink.send(frame).await.map_err(|source| Error::Transport {
        address: addr.to_string(),
        source,
    })
}

/// Queue pushes on their target connections
pub async fn deliver(peers: &PeerMap, notifications: Notifications) {
    if notifications.is_empty() {
        return;
    }
    let peers = peers.lock().await;
    for (target, packet) in notifications {
        match peers.get(&target) {
            Some(tx) => {
                if tx.unbounded_send(Outbound::Packet(packet)).is_err() {
                    debug!("Connection {} went away before notify", target);
                }
            }
            None => debug!("No live connection for {}, dropping notify", target),
        }
    }
}
