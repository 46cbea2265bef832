//! Client side of a registry connection

use crate::{
    codec::{self, Packet, Status},
    error::{Error, Result},
    models::RegistryAddress,
};
use async_net::TcpStream;
use async_tungstenite::{WebSocketStream, client_async};
use futures::channel::{mpsc, oneshot};
use futures::future::BoxFuture;
use futures::lock::Mutex;
use futures::stream::SplitSink;
use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::Value;
use smol::Timer;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tungstenite::Message;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_ARRIVAL: AtomicU64 = AtomicU64::new(1);

type PendingMap = Mutex<HashMap<u64, oneshot::Sender<Result<Inbound>>>>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Timing knobs for one connection
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    /// How long to wait for the socket and for each response
    pub timeout: Duration,
    /// Idle heartbeat period; zero disables heartbeats
    pub heartbeat_interval: Duration,
}

/// Payload received from the registry
///
/// `seq` increases with arrival order across all connections of the
/// process, so replies and pushes handled on different tasks can still be
/// applied in the order they came off the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    /// Arrival sequence number
    pub seq: u64,
    /// Payload data, `Null` when the packet carried none
    pub data: Value,
}

impl Inbound {
    fn arrived(data: Value) -> Self {
        Self {
            seq: NEXT_ARRIVAL.fetch_add(1, Ordering::SeqCst),
            data,
        }
    }
}

/// Something the owner of a connection must react to
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A request pushed by the registry (notify/sync data)
    Request(Inbound),
    /// The connection failed; it is closing
    Error(Error),
    /// The connection is gone and every in-flight request has failed
    Closed,
}

enum Command {
    Send(Packet),
    Close,
}

struct Shared {
    pending: PendingMap,
    next_id: AtomicU64,
    open: AtomicBool,
}

/// An established connection to one registry node
pub struct ClientConnection {
    ws: WebSocketStream<TcpStream>,
    address: RegistryAddress,
    options: ConnectionOptions,
}

impl ClientConnection {
    /// Open the socket and complete the WebSocket handshake
    ///
    /// Failures here fail the ready-wait; nothing is emitted as an event.
    pub async fn connect(address: RegistryAddress, options: ConnectionOptions) -> Result<Self> {
        let transport = |source: tungstenite::Error| Error::Transport {
            address: address.to_string(),
            source,
        };

        let connect = TcpStream::connect((address.host.as_str(), address.port));
        let timeout = async {
            Timer::after(options.timeout).await;
            Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connect timed out",
            ))
        };
        let stream = smol::future::or(connect, timeout)
            .await
            .map_err(|e| transport(e.into()))?;
        stream
            .set_nodelay(true)
            .map_err(|e| transport(e.into()))?;

        let url = format!("ws://{}", address);
        let (ws, _) = client_async(&url, stream).await.map_err(transport)?;

        info!("Connected to registry at {}", address);

        Ok(Self {
            ws,
            address,
            options,
        })
    }

    /// Start the connection driver
    ///
    /// Returns the handle used to send requests, the stream of events the
    /// owner must consume, and the driver future the caller has to spawn.
    pub fn start(
        self,
    ) -> (
        ConnectionHandle,
        async_channel::Receiver<ConnectionEvent>,
        BoxFuture<'static, ()>,
    ) {
        let Self {
            ws,
            address,
            options,
        } = self;

        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            open: AtomicBool::new(true),
        });
        let (commands, command_rx) = mpsc::unbounded();
        let (events_tx, events_rx) = async_channel::unbounded();
        let (done_tx, done_rx) = async_channel::bounded::<()>(1);

        let handle = ConnectionHandle {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            address: address.clone(),
            timeout: options.timeout,
            commands,
            shared: shared.clone(),
            done: done_rx,
        };

        let driver = Driver {
            address: address.to_string(),
            shared,
            events: events_tx,
        };
        let future = async move {
            driver.run(ws, command_rx, options.heartbeat_interval).await;
            done_tx.close();
        };

        (handle, events_rx, Box::pin(future))
    }
}

struct Driver {
    address: String,
    shared: Arc<Shared>,
    events: async_channel::Sender<ConnectionEvent>,
}

impl Driver {
    async fn run(
        self,
        ws: WebSocketStream<TcpStream>,
        mut commands: mpsc::UnboundedReceiver<Command>,
        heartbeat_interval: Duration,
    ) {
        let (mut sink, mut stream) = StreamExt::split(ws);
        let mut heartbeat = if heartbeat_interval.is_zero() {
            Timer::never()
        } else {
            Timer::interval(heartbeat_interval)
        };
        let mut failure = None;

        loop {
            futures::select! {
                command = commands.next() => match command {
                    Some(Command::Send(packet)) => {
                        if let Err(e) = self.write(&mut sink, &packet).await {
                            failure = Some(e);
                            break;
                        }
                    }
                    Some(Command::Close) | None => {
                        debug!("Closing connection to {}", self.address);
                        let _ = sink.close().await;
                        break;
                    }
                },

                message = stream.next().fuse() => match message {
                    Some(Ok(message)) => match codec::decode(&message, &self.address) {
                        Ok(Some(packet)) => {
                            if let Err(e) = self.handle_packet(&mut sink, packet).await {
                                failure = Some(e);
                                break;
                            }
                        }
                        Ok(None) => {
                            if let Message::Close(_) = message {
                                info!("Registry {} closed the connection", self.address);
                                break;
                            }
                        }
                        Err(e) => {
                            error!("{}", e);
                            failure = Some(e);
                            break;
                        }
                    },
                    Some(Err(e)) => {
                        error!("WebSocket error from {}: {}", self.address, e);
                        failure = Some(Error::Transport {
                            address: self.address.clone(),
                            source: e,
                        });
                        break;
                    }
                    None => break,
                },

                _ = heartbeat.next().fuse() => {
                    // Requests already in flight prove liveness
                    if !self.shared.pending.lock().await.is_empty() {
                        continue;
                    }
                    let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
                    debug!("Sending heartbeat #{} to {}", id, self.address);
                    if let Err(e) = self.write(&mut sink, &Packet::heartbeat(id)).await {
                        failure = Some(e);
                        break;
                    }
                }
            }
        }

        self.shared.open.store(false, Ordering::SeqCst);
        commands.close();

        let pending: Vec<_> = self.shared.pending.lock().await.drain().collect();
        for (id, waiter) in pending {
            debug!("Failing in-flight request #{} to {}", id, self.address);
            let _ = waiter.send(Err(Error::ConnectionClosed(self.address.clone())));
        }

        if let Some(e) = failure {
            let _ = self.events.send(ConnectionEvent::Error(e)).await;
        }
        let _ = self.events.send(ConnectionEvent::Closed).await;
        info!("Connection to {} closed", self.address);
    }

    async fn write(&self, sink: &mut WsSink, packet: &Packet) -> Result<()> {
        let frame = codec::encode(packet)?;
        sink.send(frame).await.map_err(|source| Error::Transport {
            address: self.address.clone(),
            source,
        })
    }

    async fn handle_packet(&self, sink: &mut WsSink, packet: Packet) -> Result<()> {
        match packet {
            Packet::Response {
                id,
                status,
                event,
                data,
                error_msg,
            } => {
                let waiter = self.shared.pending.lock().await.remove(&id);
                match waiter {
                    Some(waiter) => {
                        let result = if status == Status::Ok {
                            Ok(Inbound::arrived(data.unwrap_or(Value::Null)))
                        } else {
                            Err(Error::RequestFailed(
                                error_msg.unwrap_or_else(|| "unknown server error".to_string()),
                            ))
                        };
                        let _ = waiter.send(result);
                    }
                    None if !event => {
                        warn!(
                            "Paired request #{} to {} not found, it may have timed out",
                            id, self.address
                        );
                    }
                    None => {}
                }
                Ok(())
            }
            packet @ Packet::Request { .. } if packet.is_heartbeat() => {
                self.write(sink, &Packet::heartbeat_response(packet.id())).await
            }
            Packet::Request { data, .. } => {
                if let Some(data) = data {
                    let inbound = Inbound::arrived(data);
                    let _ = self.events.send(ConnectionEvent::Request(inbound)).await;
                }
                Ok(())
            }
        }
    }
}

/// Handle for sending requests over a running connection
#[derive(Clone)]
pub struct ConnectionHandle {
    id: u64,
    address: RegistryAddress,
    timeout: Duration,
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
    done: async_channel::Receiver<()>,
}

impl ConnectionHandle {
    /// Process-unique connection identity
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Registry node this connection talks to
    pub fn address(&self) -> &RegistryAddress {
        &self.address
    }

    /// Whether the connection is still usable
    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    /// Number of requests awaiting a response
    pub async fn in_flight(&self) -> usize {
        self.shared.pending.lock().await.len()
    }

    /// Send a request and wait for its response data
    pub async fn request(&self, data: Value) -> Result<Inbound> {
        if !self.is_open() {
            return Err(Error::ConnectionClosed(self.address.to_string()));
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(id, tx);

        if self
            .commands
            .unbounded_send(Command::Send(Packet::request(id, data)))
            .is_err()
        {
            self.shared.pending.lock().await.remove(&id);
            return Err(Error::ConnectionClosed(self.address.to_string()));
        }

        let timeout = self.timeout;
        let response = smol::future::or(async { Some(rx.await) }, async {
            Timer::after(timeout).await;
            None
        })
        .await;

        match response {
            Some(Ok(result)) => result,
            Some(Err(_)) => Err(Error::ConnectionClosed(self.address.to_string())),
            None => {
                self.shared.pending.lock().await.remove(&id);
                Err(Error::RequestTimeout {
                    id,
                    address: self.address.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Ask the driver to close the connection
    pub fn close(&self) {
        self.shared.open.store(false, Ordering::SeqCst);
        let _ = self.commands.unbounded_send(Command::Close);
    }

    /// Wait until the driver has exited and in-flight requests have failed
    pub async fn closed(&self) {
        let _ = self.done.recv().await;
    }
}
