//! Registry client session
//!
//! A [`RegistryClient`] keeps one logged-in connection to a registry node,
//! replays its subscriptions and publications after every (re)login, and
//! delivers provider URL lists to listeners.
//!
//! Registry calls are retried until they succeed with a linearly growing,
//! capped delay. A lost connection triggers a reconnect loop that walks the
//! server-advertised registries first and the configured ones second.

use crate::{
    cache::LocalCache,
    config::ClientConfig,
    connection::{ClientConnection, ConnectionEvent, ConnectionHandle, ConnectionOptions, Inbound},
    error::{Error, Result},
    models::{ClientEvent, Listener, ListenerId, RegistryAddress, ServiceDescriptor},
    protocol::{DUBBO_VERSION, LoginInfo, NotifyPayload, RegistryReply, RegistryRequest, UrlPayload},
    retry::{RegistryCall, RetrySlot, RetryState, RetryToken},
    url::{
        CATEGORY_KEY, DEFAULT_CATEGORY, GROUP_KEY, INTERFACE_KEY, OVERRIDE_PROTOCOL,
        PROVIDERS_CATEGORY, ServiceUrl, VERSION_KEY,
    },
};
use futures::lock::Mutex;
use indexmap::{IndexMap, IndexSet};
use rand::Rng;
use smol::Timer;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

const EVENT_QUEUE_SIZE: usize = 64;
const CONNECT_ROUNDS: usize = 3;

/// Client session against a registry cluster
///
/// Cloning is cheap; every clone drives the same session.
#[derive(Clone)]
pub struct RegistryClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    config_registries: Vec<RegistryAddress>,
    session: Mutex<Session>,
    connect_lock: Mutex<()>,
    running: AtomicBool,
    reconnecting: AtomicBool,
    next_listener_id: AtomicU64,
    deliveries: async_channel::Sender<Delivery>,
    events: async_channel::Sender<ClientEvent>,
    events_rx: async_channel::Receiver<ClientEvent>,
    shutdown: async_channel::Sender<()>,
    shutdown_rx: async_channel::Receiver<()>,
}

#[derive(Default)]
struct Session {
    conn: Option<ConnectionHandle>,
    /// Connection still logging in
    connecting: Option<ConnectionHandle>,
    logged_in: bool,
    registry_version: Option<String>,
    sync_registries: Vec<RegistryAddress>,
    sync_seq: u64,
    subscribed: HashMap<String, Subscription>,
    published: IndexMap<String, ServiceUrl>,
    retries: HashMap<RetrySlot, RetryToken>,
}

struct Subscription {
    url: ServiceUrl,
    value: Option<Arc<Vec<String>>>,
    /// Arrival sequence of the payload `value` came from
    seq: u64,
    listeners: Vec<(ListenerId, Listener)>,
}

struct Delivery {
    listeners: Vec<Listener>,
    value: Arc<Vec<String>>,
    persist: Option<ServiceUrl>,
}

impl Session {
    /// Start tracking `call`, superseding any retry in the same slot
    fn track(&mut self, call: RegistryCall, period: Duration) -> RetryState {
        let state = RetryState::new(call, period);
        if let Some(previous) = self
            .retries
            .insert(state.call.slot(), state.token().clone())
        {
            previous.cancel();
        }
        state
    }

    /// Cancel whatever retry occupies `slot`
    fn cancel(&mut self, slot: &RetrySlot) {
        if let Some(token) = self.retries.remove(slot) {
            token.cancel();
        }
    }

    /// Forget a finished retry unless a newer one took its slot
    fn untrack(&mut self, state: &RetryState) {
        let slot = state.call.slot();
        if self
            .retries
            .get(&slot)
            .is_some_and(|token| token.same(state.token()))
        {
            self.retries.remove(&slot);
        }
    }

    /// Whether `call` still matches what the caller asked for
    fn wants(&self, call: &RegistryCall) -> bool {
        let key = call.service_key();
        match call {
            RegistryCall::Subscribe(_) => self.subscribed.contains_key(&key),
            RegistryCall::Unsubscribe(_) => !self.subscribed.contains_key(&key),
            RegistryCall::Register(_) => self.published.contains_key(&key),
            RegistryCall::Unregister(_) => !self.published.contains_key(&key),
        }
    }
}

impl RegistryClient {
    /// Create a session; nothing is sent until [`RegistryClient::ready`]
    ///
    /// With a cache directory configured, cached subscriptions are loaded
    /// so late listeners get the last known value before any login.
    pub async fn new(config: ClientConfig) -> Result<Self> {
        let config_registries = config.registry_addresses()?;
        if config_registries.is_empty() {
            return Err(Error::InvalidDescriptor(
                "at least one registry address is required".to_string(),
            ));
        }

        let mut subscribed = HashMap::new();
        let mut cache_errors = Vec::new();
        let cache = match &config.local_cache_dir {
            Some(dir) => {
                let cache = LocalCache::open(dir).await?;
                let snapshot = cache.load_all().await?;
                for (key, entry) in snapshot.entries {
                    subscribed.insert(
                        key,
                        Subscription {
                            url: entry.url,
                            value: Some(Arc::new(entry.value)),
                            seq: 0,
                            listeners: Vec::new(),
                        },
                    );
                }
                cache_errors = snapshot.errors;
                Some(cache)
            }
            None => None,
        };

        let (deliveries, delivery_rx) = async_channel::unbounded();
        smol::spawn(dispatch(delivery_rx, cache)).detach();
        let (events, events_rx) = async_channel::bounded(EVENT_QUEUE_SIZE);
        let (shutdown, shutdown_rx) = async_channel::bounded(1);

        let inner = Arc::new(Inner {
            config,
            config_registries,
            session: Mutex::new(Session {
                subscribed,
                ..Session::default()
            }),
            connect_lock: Mutex::new(()),
            running: AtomicBool::new(true),
            reconnecting: AtomicBool::new(false),
            next_listener_id: AtomicU64::new(1),
            deliveries,
            events,
            events_rx,
            shutdown,
            shutdown_rx,
        });

        for error in cache_errors {
            inner.report_error(error);
        }

        Ok(Self { inner })
    }

    /// Connect and log in
    ///
    /// On failure the error is returned and reconnection keeps going in the
    /// background.
    pub async fn ready(&self) -> Result<()> {
        match self.inner.connect().await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Initial registry connection failed: {}", e);
                self.inner.trigger_reconnect();
                Err(e)
            }
        }
    }

    /// Attach `listener` to the provider list of a service
    ///
    /// A known value is delivered right away; otherwise the listener fires
    /// once the registry answers. Listeners are invoked in order on a
    /// dedicated task.
    pub async fn subscribe<F>(&self, descriptor: &ServiceDescriptor, listener: F) -> Result<ListenerId>
    where
        F: Fn(&[String]) + Send + Sync + 'static,
    {
        descriptor.validate("subscribe")?;
        let url = self.inner.consumer_url(descriptor);
        let key = service_key(&url)?;
        let id = ListenerId(self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed));
        let listener: Listener = Arc::new(listener);

        let mut session = self.inner.session.lock().await;
        let call = match session.subscribed.get_mut(&key) {
            Some(subscription) => {
                subscription.listeners.push((id, listener.clone()));
                if let Some(value) = &subscription.value {
                    self.inner.deliver(vec![listener], value.clone(), None);
                }
                None
            }
            None => {
                session.subscribed.insert(
                    key.clone(),
                    Subscription {
                        url: url.clone(),
                        value: None,
                        seq: 0,
                        listeners: vec![(id, listener)],
                    },
                );
                let call = RegistryCall::Subscribe(url);
                if session.logged_in {
                    Some(session.track(call, self.inner.config.retry_period()))
                } else {
                    session.cancel(&call.slot());
                    None
                }
            }
        };
        drop(session);

        debug!("Listener {:?} attached to {}", id, key);
        if let Some(state) = call {
            self.inner.spawn_call(state);
        }
        Ok(id)
    }

    /// Detach one listener, or all listeners when `listener` is `None`
    ///
    /// The registry subscription is withdrawn once no listener remains.
    pub async fn unsubscribe(
        &self,
        descriptor: &ServiceDescriptor,
        listener: Option<ListenerId>,
    ) -> Result<()> {
        descriptor.validate("unsubscribe")?;
        let key = service_key(&self.inner.consumer_url(descriptor))?;

        let mut session = self.inner.session.lock().await;
        let Some(subscription) = session.subscribed.get_mut(&key) else {
            return Ok(());
        };
        match listener {
            Some(id) => subscription.listeners.retain(|(attached, _)| *attached != id),
            None => subscription.listeners.clear(),
        }
        if !subscription.listeners.is_empty() {
            return Ok(());
        }

        let Some(subscription) = session.subscribed.remove(&key) else {
            return Ok(());
        };
        let call = RegistryCall::Unsubscribe(subscription.url);
        let state = if session.logged_in {
            Some(session.track(call, self.inner.config.retry_period()))
        } else {
            session.cancel(&call.slot());
            None
        };
        drop(session);

        if let Some(state) = state {
            self.inner.spawn_call(state);
        }
        Ok(())
    }

    /// Announce a provider; publishing the same service key twice is a no-op
    pub async fn publish(&self, descriptor: &ServiceDescriptor) -> Result<()> {
        descriptor.validate("publish")?;
        let url = self.inner.provider_url(descriptor)?;
        let key = service_key(&url)?;

        let mut session = self.inner.session.lock().await;
        if session.published.contains_key(&key) {
            debug!("{} already published", key);
            return Ok(());
        }
        session.published.insert(key, url.clone());
        let call = RegistryCall::Register(url);
        let state = if session.logged_in {
            Some(session.track(call, self.inner.config.retry_period()))
        } else {
            session.cancel(&call.slot());
            None
        };
        drop(session);

        if let Some(state) = state {
            self.inner.spawn_call(state);
        }
        Ok(())
    }

    /// Withdraw a provider announced with [`RegistryClient::publish`]
    pub async fn unpublish(&self, descriptor: &ServiceDescriptor) -> Result<()> {
        descriptor.validate("unpublish")?;
        let key = service_key(&self.inner.consumer_url(descriptor))?;

        let mut session = self.inner.session.lock().await;
        let Some(url) = session.published.shift_remove(&key) else {
            return Ok(());
        };
        let call = RegistryCall::Unregister(url);
        let state = if session.logged_in {
            Some(session.track(call, self.inner.config.retry_period()))
        } else {
            session.cancel(&call.slot());
            None
        };
        drop(session);

        if let Some(state) = state {
            self.inner.spawn_call(state);
        }
        Ok(())
    }

    /// Session events: logins and non-fatal errors
    ///
    /// Receivers share one queue; each event goes to one receiver.
    pub fn events(&self) -> async_channel::Receiver<ClientEvent> {
        self.inner.events_rx.clone()
    }

    /// Protocol version reported by the registry on login
    pub async fn registry_version(&self) -> Option<String> {
        self.inner.session.lock().await.registry_version.clone()
    }

    /// Whether the registry never reported a protocol version
    pub async fn is_old_registry(&self) -> bool {
        self.registry_version().await.is_none()
    }

    /// Whether a logged-in connection is active
    pub async fn is_connected(&self) -> bool {
        self.inner.is_connected().await
    }

    /// Address of the active registry node
    pub async fn current_registry(&self) -> Option<RegistryAddress> {
        let session = self.inner.session.lock().await;
        session.conn.as_ref().map(|conn| conn.address().clone())
    }

    /// Stop retrying, close the connection and drop pending work
    pub async fn close(&self) {
        let inner = &self.inner;
        inner.running.store(false, Ordering::SeqCst);
        inner.reconnecting.store(false, Ordering::SeqCst);
        inner.shutdown.close();

        let conns = {
            let mut session = inner.session.lock().await;
            session.logged_in = false;
            for (_, token) in session.retries.drain() {
                token.cancel();
            }
            [session.conn.take(), session.connecting.take()]
        };
        for conn in conns.into_iter().flatten() {
            conn.close();
            conn.closed().await;
        }

        inner.deliveries.close();
        inner.events.close();
        info!("Registry client closed");
    }
}

impl Inner {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn is_connected(&self) -> bool {
        let session = self.session.lock().await;
        session.logged_in && session.conn.as_ref().is_some_and(|conn| conn.is_open())
    }

    fn options(&self) -> ConnectionOptions {
        ConnectionOptions {
            timeout: self.config.timeout(),
            heartbeat_interval: self.config.heartbeat_interval(),
        }
    }

    fn common_parameters(&self) -> IndexMap<String, String> {
        IndexMap::from([
            ("application".to_string(), self.config.app_name.clone()),
            ("dubbo".to_string(), DUBBO_VERSION.to_string()),
            ("check".to_string(), "false".to_string()),
            ("pid".to_string(), std::process::id().to_string()),
            ("protocol".to_string(), "dubbo".to_string()),
            ("revision".to_string(), "1.0.0".to_string()),
            (
                "timestamp".to_string(),
                chrono::Utc::now().timestamp_millis().to_string(),
            ),
        ])
    }

    fn consumer_url(&self, descriptor: &ServiceDescriptor) -> ServiceUrl {
        let mut url = ServiceUrl::new("consumer", &self.config.local_host, 0, descriptor.path());
        url.parameters = self.common_parameters();
        url.parameters.extend([
            (
                CATEGORY_KEY.to_string(),
                "providers,configurators,routers".to_string(),
            ),
            ("methods".to_string(), "*".to_string()),
            ("side".to_string(), "consumer".to_string()),
            (INTERFACE_KEY.to_string(), descriptor.interface_name.clone()),
            (VERSION_KEY.to_string(), descriptor.version.clone()),
        ]);
        if let Some(group) = descriptor.group() {
            url.parameters.insert(GROUP_KEY.to_string(), group.to_string());
        }
        url
    }

    fn provider_url(&self, descriptor: &ServiceDescriptor) -> Result<ServiceUrl> {
        let raw = descriptor
            .url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| Error::InvalidDescriptor("publish: url is required".to_string()))?;

        let mut url = ServiceUrl::value_of(raw)?;
        if url.path().is_empty() {
            url.set_path(descriptor.path());
        }

        let mut parameters = self.common_parameters();
        parameters.extend([
            ("anyhost".to_string(), "true".to_string()),
            ("codec".to_string(), "dubbo".to_string()),
            ("methods".to_string(), "*".to_string()),
            ("side".to_string(), "provider".to_string()),
            ("threads".to_string(), self.config.provider_threads.to_string()),
            (INTERFACE_KEY.to_string(), descriptor.interface_name.clone()),
            (VERSION_KEY.to_string(), descriptor.version.clone()),
        ]);
        if let Some(group) = descriptor.group() {
            parameters.insert(GROUP_KEY.to_string(), group.to_string());
        }
        // Parameters carried by the export URL win
        parameters.extend(std::mem::take(&mut url.parameters));
        url.parameters = parameters;
        Ok(url)
    }

    /// Queue a value for listeners and, with `persist`, the local cache
    ///
    /// Callers hold the session lock so queue order is computation order.
    fn deliver(&self, listeners: Vec<Listener>, value: Arc<Vec<String>>, persist: Option<ServiceUrl>) {
        if listeners.is_empty() && persist.is_none() {
            return;
        }
        let delivery = Delivery {
            listeners,
            value,
            persist,
        };
        if self.deliveries.try_send(delivery).is_err() {
            debug!("Listener dispatcher stopped, dropping delivery");
        }
    }

    fn emit(&self, event: ClientEvent) {
        if self.events.try_send(event).is_err() {
            debug!("Client event queue unavailable, dropping event");
        }
    }

    /// Raise a session-level error event while the session is running
    fn report_error(&self, error: Error) {
        if !self.is_running() {
            return;
        }
        warn!("{}", error);
        self.emit(ClientEvent::Error(Arc::new(error)));
    }

    /// Sleep for `delay` unless the session closes first
    async fn sleep(&self, delay: Duration) -> bool {
        let shutdown = self.shutdown_rx.clone();
        let elapsed = smol::future::or(
            async {
                Timer::after(delay).await;
                true
            },
            async move {
                let _ = shutdown.recv().await;
                false
            },
        )
        .await;
        elapsed && self.is_running()
    }

    /// Walk the sync pool, then the configured pool, until a login succeeds
    ///
    /// A registry may advertise a new sync pool while refusing to keep the
    /// session; the walk then starts over with the new pool.
    async fn connect(self: &Arc<Self>) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        let mut tried = IndexSet::new();

        for _ in 0..CONNECT_ROUNDS {
            let sync_registries = self.session.lock().await.sync_registries.clone();

            for pool in [&sync_registries, &self.config_registries] {
                if pool.is_empty() {
                    continue;
                }
                let offset = rand::thread_rng().gen_range(0..pool.len());
                for i in 0..pool.len() {
                    if !self.is_running() {
                        return Err(Error::NotConnected);
                    }
                    let address = &pool[(offset + i) % pool.len()];
                    tried.insert(address.to_string());
                    match self.create_connection(address).await {
                        Ok(()) => return Ok(()),
                        Err(_) if !self.is_running() => return Err(Error::NotConnected),
                        Err(e) => warn!("Failed to use registry {}: {}", address, e),
                    }
                }
            }

            if self.session.lock().await.sync_registries == sync_registries {
                break;
            }
        }

        Err(Error::ConnectionExhausted {
            addresses: tried.into_iter().collect(),
        })
    }

    async fn create_connection(self: &Arc<Self>, address: &RegistryAddress) -> Result<()> {
        info!("Trying to connect to registry {}", address);
        let connection = ClientConnection::connect(address.clone(), self.options()).await?;
        let (handle, events, driver) = connection.start();
        smol::spawn(driver).detach();
        smol::spawn(self.clone().pump(handle.clone(), events)).detach();

        {
            let mut session = self.session.lock().await;
            if !self.is_running() {
                drop(session);
                handle.close();
                return Err(Error::NotConnected);
            }
            session.connecting = Some(handle.clone());
        }
        let result = self.log_in(&handle, address).await;
        self.session.lock().await.connecting = None;
        result
    }

    /// Log in on `handle`, make it the active connection and recover
    async fn log_in(self: &Arc<Self>, handle: &ConnectionHandle, address: &RegistryAddress) -> Result<()> {
        let login = RegistryRequest::Login(LoginInfo {
            username: self.config.username.clone(),
            password: self.config.password.clone(),
            application: Some(self.config.app_name.clone()),
            protocol_version: Some(DUBBO_VERSION.to_string()),
        });
        let reply = match self.send(handle, &login).await {
            Ok(reply) => reply,
            Err(e) => {
                handle.close();
                return Err(e);
            }
        };
        if !reply.is_ok() {
            handle.close();
            return Err(Error::LoginRejected {
                address: address.to_string(),
                reason: reply
                    .message
                    .unwrap_or_else(|| "login not accepted".to_string()),
            });
        }
        if !handle.is_open() {
            return Err(Error::ConnectionClosed(address.to_string()));
        }

        // A stale connection is fully closed before the new one takes over
        let stale = self.session.lock().await.conn.take();
        if let Some(stale) = stale {
            stale.close();
            stale.closed().await;
        }
        {
            let mut session = self.session.lock().await;
            if !self.is_running() {
                drop(session);
                debug!("Session closed during login to {}, dropping connection", address);
                handle.close();
                handle.closed().await;
                return Err(Error::NotConnected);
            }
            session.conn = Some(handle.clone());
            session.logged_in = true;
        }
        if !handle.is_open() {
            self.deactivate(handle).await;
            return Err(Error::ConnectionClosed(address.to_string()));
        }

        info!("Login to registry {} succeeded", address);
        self.emit(ClientEvent::LoggedIn(address.clone()));
        self.recover().await;
        Ok(())
    }

    /// Clear `handle` if it is the active connection; true when it was
    async fn deactivate(&self, handle: &ConnectionHandle) -> bool {
        let mut session = self.session.lock().await;
        if session.conn.as_ref().map(ConnectionHandle::id) == Some(handle.id()) {
            session.conn = None;
            session.logged_in = false;
            true
        } else {
            false
        }
    }

    /// Consume the events of one connection until it closes
    async fn pump(
        self: Arc<Self>,
        handle: ConnectionHandle,
        events: async_channel::Receiver<ConnectionEvent>,
    ) {
        while let Ok(event) = events.recv().await {
            match event {
                ConnectionEvent::Request(Inbound { seq, data }) => match serde_json::from_value::<RegistryReply>(data) {
                    Ok(reply) => self.handle_reply(&reply, seq, &handle).await,
                    Err(e) => warn!("Ignoring unrecognised push from {}: {}", handle.address(), e),
                },
                ConnectionEvent::Error(e) => {
                    warn!("Connection to {} failed: {}", handle.address(), e);
                }
                ConnectionEvent::Closed => {
                    if self.deactivate(&handle).await && self.is_running() {
                        info!("Active connection to {} closed, reconnecting", handle.address());
                        self.trigger_reconnect();
                    }
                    break;
                }
            }
        }
    }

    fn trigger_reconnect(self: &Arc<Self>) {
        if !self.is_running() {
            return;
        }
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            debug!("Reconnect already in progress");
            return;
        }
        let inner = self.clone();
        smol::spawn(async move { inner.reconnect_loop().await }).detach();
    }

    async fn reconnect_loop(self: Arc<Self>) {
        while self.is_running() {
            if !self.sleep(self.config.retry_period()).await {
                break;
            }
            if self.is_connected().await {
                break;
            }
            match self.connect().await {
                Ok(()) => break,
                Err(e) => self.report_error(e),
            }
        }
        self.reconnecting.store(false, Ordering::SeqCst);

        // The new connection may have dropped while the flag was still set
        if self.is_running() && !self.is_connected().await {
            self.trigger_reconnect();
        }
    }

    /// Replay subscriptions, then publications, on the new connection
    async fn recover(self: &Arc<Self>) {
        let period = self.config.retry_period();
        let calls: Vec<RetryState> = {
            let mut session = self.session.lock().await;
            let subscriptions: Vec<_> = session
                .subscribed
                .values()
                .map(|s| RegistryCall::Subscribe(s.url.clone()))
                .collect();
            let publications: Vec<_> = session
                .published
                .values()
                .map(|url| RegistryCall::Register(url.clone()))
                .collect();
            debug!(
                "Recovering {} subscriptions and {} publications",
                subscriptions.len(),
                publications.len()
            );
            subscriptions
                .into_iter()
                .chain(publications)
                .map(|call| session.track(call, period))
                .collect()
        };
        for state in calls {
            self.call_with_retry(state).await;
        }
    }

    fn spawn_call(self: &Arc<Self>, state: RetryState) {
        let inner = self.clone();
        smol::spawn(async move { inner.call_with_retry(state).await }).detach();
    }

    /// First attempt inline; later attempts on a background task
    async fn call_with_retry(self: &Arc<Self>, state: RetryState) {
        if self.attempt(&state).await {
            self.session.lock().await.untrack(&state);
            return;
        }
        let inner = self.clone();
        smol::spawn(async move { inner.retry_loop(state).await }).detach();
    }

    async fn retry_loop(self: Arc<Self>, mut state: RetryState) {
        loop {
            let delay = state.next_delay();
            state.advance();
            if !self.sleep(delay).await {
                debug!("Dropping retry of {} after close", state.call);
                return;
            }
            if self.attempt(&state).await {
                self.session.lock().await.untrack(&state);
                return;
            }
        }
    }

    /// One attempt; true when no further attempt is needed
    async fn attempt(&self, state: &RetryState) -> bool {
        if !self.still_wanted(state).await {
            debug!("Dropping {}, superseded", state.call);
            return true;
        }
        let succeeded = self.call(state).await;
        if succeeded {
            info!("{} succeeded at attempt {}", state.call, state.attempt);
        } else {
            warn!(
                "{} failed at attempt {}, retrying in {:?}",
                state.call,
                state.attempt,
                state.next_delay()
            );
        }
        succeeded
    }

    /// Whether `state` is neither cancelled nor contradicted by the session
    async fn still_wanted(&self, state: &RetryState) -> bool {
        !state.is_cancelled() && self.session.lock().await.wants(&state.call)
    }

    async fn call(&self, state: &RetryState) -> bool {
        if !self.is_running() {
            return false;
        }
        match &state.call {
            RegistryCall::Register(url) => self.send_url(RegistryRequest::Register, url).await,
            RegistryCall::Unregister(url) => self.send_url(RegistryRequest::Unregister, url).await,
            RegistryCall::Subscribe(url) => {
                let consumer = RegistryCall::consumer_url(url);
                if !self.send_url(RegistryRequest::Register, &consumer).await {
                    return false;
                }
                // Withdrawn between the two steps
                if !self.still_wanted(state).await {
                    return true;
                }
                self.send_url(RegistryRequest::Subscribe, url).await
            }
            RegistryCall::Unsubscribe(url) => {
                let consumer = RegistryCall::consumer_url(url);
                if !self.send_url(RegistryRequest::Unregister, &consumer).await {
                    return false;
                }
                // Subscribed again in the meantime
                if !self.still_wanted(state).await {
                    return true;
                }
                self.send_url(RegistryRequest::Unsubscribe, url).await
            }
        }
    }

    /// Send one URL request on the active connection
    ///
    /// Registries that never reported a version get the service key form.
    async fn send_url(&self, request: fn(UrlPayload) -> RegistryRequest, url: &ServiceUrl) -> bool {
        let (handle, payload) = {
            let session = self.session.lock().await;
            match (&session.conn, session.logged_in) {
                (Some(conn), true) => (
                    conn.clone(),
                    UrlPayload::for_registry(url, session.registry_version.as_deref()),
                ),
                _ => {
                    debug!("Not logged in, deferring request for {}", url);
                    return false;
                }
            }
        };
        let request = request(payload);
        match self.send(&handle, &request).await {
            Ok(reply) => reply.is_ok(),
            Err(e) => {
                warn!("{} via {} failed: {}", request.kind(), handle.address(), e);
                false
            }
        }
    }

    async fn send(&self, handle: &ConnectionHandle, request: &RegistryRequest) -> Result<RegistryReply> {
        let data = serde_json::to_value(request)?;
        let Inbound { seq, data } = handle.request(data).await?;
        let reply = if data.is_null() {
            RegistryReply::default()
        } else {
            serde_json::from_value(data)?
        };
        self.handle_reply(&reply, seq, handle).await;
        Ok(reply)
    }

    /// Apply a reply or push that arrived as number `seq` on `handle`
    async fn handle_reply(&self, reply: &RegistryReply, seq: u64, handle: &ConnectionHandle) {
        debug!("Received data #{} from {}: {:?}", seq, handle.address(), reply);
        if let Some(version) = &reply.protocol_version {
            self.session.lock().await.registry_version = Some(version.clone());
        }
        if let Some(notify) = &reply.notify {
            self.on_notify(notify, seq).await;
        }
        if let Some(sync) = &reply.sync {
            self.on_sync(sync, seq, handle).await;
        }
        if let Some(message) = &reply.message {
            self.report_error(Error::ServerReported(message.clone()));
        }
    }

    async fn on_notify(&self, payload: &NotifyPayload, seq: u64) {
        let Some((key, urls)) = providers_from_notify(payload) else {
            return;
        };

        let mut session = self.session.lock().await;
        let Some(subscription) = session.subscribed.get_mut(&key) else {
            warn!("No subscription found for {}", key);
            return;
        };
        if seq < subscription.seq {
            debug!("Ignoring notify #{} for {}, #{} already applied", seq, key, subscription.seq);
            return;
        }
        subscription.seq = seq;
        if subscription.value.as_deref() == Some(&urls) {
            info!("Provider list for {} unchanged", key);
            return;
        }

        let value = Arc::new(urls);
        subscription.value = Some(value.clone());
        let listeners = subscription
            .listeners
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        let url = subscription.url.clone();
        self.deliver(listeners, value, Some(url));
    }

    async fn on_sync(&self, addresses: &[String], seq: u64, handle: &ConnectionHandle) {
        info!("Received sync registry addresses {:?}", addresses);
        let registries: Vec<RegistryAddress> = addresses
            .iter()
            .filter_map(|addr| match RegistryAddress::parse(addr, self.config.default_port) {
                Ok(addr) => Some(addr),
                Err(e) => {
                    warn!("Ignoring sync address: {}", e);
                    None
                }
            })
            .collect();

        let keep = registries.is_empty() || registries.contains(handle.address());
        {
            let mut session = self.session.lock().await;
            if seq < session.sync_seq {
                debug!("Ignoring sync #{}, #{} already applied", seq, session.sync_seq);
                return;
            }
            session.sync_seq = seq;
            session.sync_registries = registries;
        }

        if !keep && handle.is_open() {
            info!(
                "Current registry {} is not among the sync addresses, reconnecting",
                handle.address()
            );
            handle.close();
        }
    }
}

/// Deliver values to listeners, then persist them, in computation order
async fn dispatch(deliveries: async_channel::Receiver<Delivery>, cache: Option<LocalCache>) {
    while let Ok(Delivery {
        listeners,
        value,
        persist,
    }) = deliveries.recv().await
    {
        for listener in &listeners {
            listener(&value);
        }
        if let (Some(cache), Some(url)) = (&cache, persist) {
            if let Err(e) = cache.write(&url, &value).await {
                warn!("Failed to write local cache for {}: {}", url, e);
            }
        }
    }
}

fn service_key(url: &ServiceUrl) -> Result<String> {
    url.service_key()
        .ok_or_else(|| Error::invalid_url(url.to_full_string(), "missing service interface"))
}

/// Service key and provider URL strings carried by a notify payload
fn providers_from_notify(payload: &NotifyPayload) -> Option<(String, Vec<String>)> {
    match payload {
        NotifyPayload::UrlList(list) => {
            let urls: Vec<ServiceUrl> = list
                .iter()
                .filter_map(|raw| match ServiceUrl::value_of(raw) {
                    Ok(url) => Some(url),
                    Err(e) => {
                        warn!("Ignoring notified url: {}", e);
                        None
                    }
                })
                .collect();
            let key = urls.first()?.service_key()?;
            let providers = urls
                .iter()
                .filter(|url| url.parameter_or(CATEGORY_KEY, DEFAULT_CATEGORY) == PROVIDERS_CATEGORY)
                .map(ServiceUrl::to_full_string)
                .collect();
            Some((key, providers))
        }
        NotifyPayload::LegacyMap(map) => {
            let mut urls = Vec::new();
            for (data_id, entries) in map {
                let (group, rest) = match data_id.split_once('/') {
                    Some((group, rest)) => (Some(group), rest),
                    None => (None, data_id.as_str()),
                };
                let (service_name, version) = match rest.split_once(':') {
                    Some((name, version)) => (name, Some(version)),
                    None => (rest, None),
                };

                for (address, parameters) in entries {
                    if address.starts_with(&format!("{OVERRIDE_PROTOCOL}://")) || parameters.is_empty() {
                        continue;
                    }
                    let mut url = match ServiceUrl::value_of(&format!("{address}?{parameters}")) {
                        Ok(url) => url,
                        Err(e) => {
                            warn!("Ignoring notified provider: {}", e);
                            continue;
                        }
                    };
                    if url.path().is_empty() {
                        url.set_path(service_name);
                    }
                    if let Some(group) = group {
                        url.parameters.insert(GROUP_KEY.to_string(), group.to_string());
                    }
                    if let Some(version) = version {
                        url.parameters.insert(VERSION_KEY.to_string(), version.to_string());
                    }
                    urls.push(url);
                }
            }

            let key = urls.first()?.service_key()?;
            let mut providers: Vec<String> = urls.iter().map(ServiceUrl::to_full_string).collect();
            providers.sort();
            Some((key, providers))
        }
    }
}
