//! Common test utilities for registry integration tests

#![allow(dead_code)]

use async_tungstenite::accept_async;
use dubbo_registry::codec::{self, Packet};
use dubbo_registry::{ClientConfig, RegistryClient, RegistryServer, ServerConfig, ServiceDescriptor};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Upper bound for anything a test waits on
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Short retry period so reconnects happen quickly
pub const RETRY_PERIOD: Duration = Duration::from_millis(200);

/// Interface used by most scenarios
pub const SERVICE: &str = "com.test.TestService";

/// Export URL of the test provider
pub const PROVIDER_URL: &str = "dubbo://127.0.0.1:12200/com.test.TestService";

/// Initialise test logging once; honours `RUST_LOG`
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Start a server on an ephemeral loopback port
pub async fn start_server(sync_registries: Vec<String>) -> RegistryServer {
    start_server_at("127.0.0.1:0", sync_registries).await
}

/// Start a server on a specific address
pub async fn start_server_at(addr: &str, sync_registries: Vec<String>) -> RegistryServer {
    init_logging();
    RegistryServer::bind(ServerConfig::new(addr).with_sync_registries(sync_registries))
        .await
        .expect("Failed to start registry server")
}

/// Client settings for the given registries, tuned for tests
pub fn client_config(registries: &[SocketAddr]) -> ClientConfig {
    let address = registries
        .iter()
        .map(SocketAddr::to_string)
        .collect::<Vec<_>>()
        .join(",");
    ClientConfig::new(&address, "test")
        .with_retry_period(RETRY_PERIOD)
        .with_timeout(Duration::from_secs(2))
}

/// A client that is already logged in
pub async fn ready_client(config: ClientConfig) -> RegistryClient {
    let client = RegistryClient::new(config).await.expect("Failed to create client");
    client.ready().await.expect("Client failed to log in");
    client
}

/// Descriptor of the test service
pub fn service() -> ServiceDescriptor {
    ServiceDescriptor::new(SERVICE, "1.0.0")
}

/// Descriptor of the test provider
pub fn provider() -> ServiceDescriptor {
    service().with_url(PROVIDER_URL)
}

/// Records every value delivered to a listener
#[derive(Clone)]
pub struct Recorder {
    tx: async_channel::Sender<Vec<String>>,
    rx: async_channel::Receiver<Vec<String>>,
}

impl Recorder {
    /// Empty recorder
    pub fn new() -> Self {
        let (tx, rx) = async_channel::unbounded();
        Self { tx, rx }
    }

    /// Listener closure feeding this recorder
    pub fn listener(&self) -> impl Fn(&[String]) + Send + Sync + 'static {
        let tx = self.tx.clone();
        move |urls: &[String]| {
            let _ = tx.try_send(urls.to_vec());
        }
    }

    /// Next delivered value
    pub async fn next(&self) -> Vec<String> {
        timeout(self.rx.recv())
            .await
            .expect("Timed out waiting for a listener delivery")
            .expect("Recorder closed")
    }

    /// Skip deliveries until one satisfies `predicate`
    pub async fn next_matching(&self, predicate: impl Fn(&[String]) -> bool) -> Vec<String> {
        loop {
            let value = self.next().await;
            if predicate(&value) {
                return value;
            }
        }
    }

    /// Everything delivered so far that has not been consumed
    pub fn drain(&self) -> Vec<Vec<String>> {
        std::iter::from_fn(|| self.rx.try_recv().ok()).collect()
    }

    /// Assert nothing is delivered for `window`
    pub async fn assert_quiet(&self, window: Duration) {
        smol::Timer::after(window).await;
        assert!(
            self.rx.is_empty(),
            "Unexpected deliveries: {:?}",
            self.drain()
        );
    }
}

/// Run `future` with [`TEST_TIMEOUT`]
pub async fn timeout<T>(future: impl Future<Output = T>) -> Option<T> {
    smol::future::or(async { Some(future.await) }, async {
        smol::Timer::after(TEST_TIMEOUT).await;
        None
    })
    .await
}

/// Poll `condition` until it holds or the test times out
pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = std::time::Instant::now() + TEST_TIMEOUT;
    while !condition().await {
        assert!(std::time::Instant::now() < deadline, "Condition not met in time");
        smol::Timer::after(Duration::from_millis(20)).await;
    }
}

/// Wait until `count` providers of `key` are registered
pub async fn wait_for_providers(server: &RegistryServer, key: &str, count: usize) {
    let registry = server.registry();
    wait_until(move || async move { registry.providers(key).await.len() == count }).await;
}

/// Wait until `count` connections subscribe to the providers of `key`
pub async fn wait_for_subscribers(server: &RegistryServer, key: &str, count: usize) {
    let registry = server.registry();
    wait_until(move || async move { registry.subscribers(key, "providers").await.len() == count })
        .await;
}

/// Wait until `client` holds a logged-in connection
pub async fn wait_for_login(client: &RegistryClient) {
    wait_until(move || async move { client.is_connected().await }).await;
}

/// How a [`ScriptedRegistry`] answers one request
pub struct Answer {
    delay: Duration,
    data: Value,
}

impl Answer {
    /// Reply with `data`
    pub fn data(data: Value) -> Self {
        Self {
            delay: Duration::ZERO,
            data,
        }
    }

    /// `{status: "ok"}`
    pub fn ok() -> Self {
        Self::data(json!({"status": "ok"}))
    }

    /// `{status: "failed"}`
    pub fn failed() -> Self {
        Self::data(json!({"status": "failed"}))
    }

    /// Hold the reply back for `delay`
    pub fn after(self, delay: Duration) -> Self {
        Self { delay, ..self }
    }
}

/// Answers like a current registry: versioned login, empty subscribe
pub fn accept_all(request: &Value) -> Answer {
    match request_kind(request).as_str() {
        "login" => Answer::data(json!({"status": "ok", "protocolVersion": "2.5.3"})),
        "subscribe" => Answer::data(json!({
            "status": "ok",
            "notify": [format!("empty://0.0.0.0/{SERVICE}?category=configurators&version=1.0.0")],
        })),
        _ => Answer::ok(),
    }
}

/// Top-level key of a request payload, e.g. `register`
pub fn request_kind(request: &Value) -> String {
    request
        .as_object()
        .and_then(|object| object.keys().next().cloned())
        .unwrap_or_default()
}

type Script = Arc<dyn Fn(&Value) -> Answer + Send + Sync>;

/// A registry node whose answers are decided by a test script
///
/// Records every non-heartbeat request and can push data to the
/// connected client.
pub struct ScriptedRegistry {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<Value>>>,
    closed: Arc<AtomicUsize>,
    pushes: async_channel::Sender<Value>,
    _accept: smol::Task<()>,
}

enum Input {
    Frame(Option<Result<tungstenite::Message, tungstenite::Error>>),
    Out(Packet),
    Push(Value),
    Stop,
}

impl ScriptedRegistry {
    /// Listen on an ephemeral loopback port
    pub async fn start(script: impl Fn(&Value) -> Answer + Send + Sync + 'static) -> Self {
        init_logging();
        let listener = async_net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let script: Script = Arc::new(script);
        let requests = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicUsize::new(0));
        let (pushes, push_rx) = async_channel::unbounded();

        let accept = {
            let requests = requests.clone();
            let closed = closed.clone();
            smol::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let connection = serve(
                        stream,
                        script.clone(),
                        requests.clone(),
                        push_rx.clone(),
                    );
                    let closed = closed.clone();
                    smol::spawn(async move {
                        connection.await;
                        closed.fetch_add(1, Ordering::SeqCst);
                    })
                    .detach();
                }
            })
        };

        Self {
            addr,
            requests,
            closed,
            pushes,
            _accept: accept,
        }
    }

    /// Listening address
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Payloads of every request received so far
    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }

    /// Kinds of every request received so far
    pub fn kinds(&self) -> Vec<String> {
        self.requests().iter().map(request_kind).collect()
    }

    /// Number of requests of `kind` received so far
    pub fn count(&self, kind: &str) -> usize {
        self.kinds().iter().filter(|k| *k == kind).count()
    }

    /// Push `data` to the connected client
    pub fn push(&self, data: Value) {
        self.pushes.try_send(data).unwrap();
    }

    /// Connections that have ended
    pub fn closed_connections(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

async fn serve(
    stream: async_net::TcpStream,
    script: Script,
    requests: Arc<Mutex<Vec<Value>>>,
    pushes: async_channel::Receiver<Value>,
) {
    static NEXT_PUSH_ID: AtomicU64 = AtomicU64::new(1_000_000);

    let Ok(mut ws) = accept_async(stream).await else {
        return;
    };
    let (out_tx, out_rx) = async_channel::unbounded::<Packet>();

    loop {
        let input = smol::future::or(
            async { Input::Frame(ws.next().await) },
            smol::future::or(
                async { out_rx.recv().await.map_or(Input::Stop, Input::Out) },
                async { pushes.recv().await.map_or(Input::Stop, Input::Push) },
            ),
        )
        .await;

        let outgoing = match input {
            Input::Frame(Some(Ok(message))) => match codec::decode(&message, "scripted") {
                Ok(Some(packet)) if packet.is_heartbeat() => {
                    (!packet.is_response()).then(|| Packet::heartbeat_response(packet.id()))
                }
                Ok(Some(Packet::Request { id, data: Some(data), .. })) => {
                    let answer = script(&data);
                    requests.lock().unwrap().push(data);
                    let reply = Packet::ok(id, answer.data);
                    if answer.delay.is_zero() {
                        Some(reply)
                    } else {
                        let out = out_tx.clone();
                        smol::spawn(async move {
                            smol::Timer::after(answer.delay).await;
                            let _ = out.send(reply).await;
                        })
                        .detach();
                        None
                    }
                }
                Ok(_) => None,
                Err(_) => break,
            },
            Input::Frame(_) | Input::Stop => break,
            Input::Out(packet) => Some(packet),
            Input::Push(data) => Some(Packet::push(NEXT_PUSH_ID.fetch_add(1, Ordering::Relaxed), data)),
        };

        if let Some(packet) = outgoing {
            if ws.send(codec::encode(&packet).unwrap()).await.is_err() {
                break;
            }
        }
    }
}
