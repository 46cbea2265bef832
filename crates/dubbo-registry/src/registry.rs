//! Server-side registration and subscription tables

use crate::{
    codec::Packet,
    error::{Error, Result},
    protocol::{NotifyPayload, RegistryReply},
    url::{
        CATEGORY_KEY, CONFIGURATORS_CATEGORY, EMPTY_PROTOCOL, PROVIDERS_CATEGORY, ServiceUrl,
        VERSION_KEY,
    },
};
use futures::lock::Mutex;
use indexmap::{IndexMap, IndexSet};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Pushes the caller must deliver, keyed by target connection
pub type Notifications = Vec<(SocketAddr, Packet)>;

type CategoryTable<T> = HashMap<String, HashMap<String, T>>;

#[derive(Default)]
struct Tables {
    /// serviceKey -> category -> connection -> full URL string
    registrations: CategoryTable<IndexMap<SocketAddr, String>>,
    /// serviceKey -> category -> subscribed connections
    subscribers: CategoryTable<IndexSet<SocketAddr>>,
}

/// In-memory registry shared by every server connection
pub struct Registry {
    tables: Mutex<Tables>,
    next_push_id: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            next_push_id: AtomicU64::new(1),
        }
    }

    /// Record `url` for `conn` under each of its categories
    ///
    /// Returns the provider-change pushes to deliver once the caller has
    /// acknowledged the request.
    pub async fn register(&self, conn: SocketAddr, url: &ServiceUrl) -> Result<Notifications> {
        let key = require_service_key(url)?;
        let full = url.to_full_string();
        let mut tables = self.tables.lock().await;
        let mut providers_changed = false;

        for category in url.categories() {
            debug!("Register {} in {}/{} for {}", full, key, category, conn);
            tables
                .registrations
                .entry(key.clone())
                .or_default()
                .entry(category.clone())
                .or_default()
                .insert(conn, full.clone());
            providers_changed |= category == PROVIDERS_CATEGORY;
        }

        Ok(if providers_changed {
            self.providers_changed(&tables, &key)
        } else {
            Vec::new()
        })
    }

    /// Remove the registrations `conn` holds for `url`'s categories
    pub async fn unregister(&self, conn: SocketAddr, url: &ServiceUrl) -> Result<Notifications> {
        let key = require_service_key(url)?;
        let mut tables = self.tables.lock().await;
        let mut providers_changed = false;

        for category in url.categories() {
            let removed = tables
                .registrations
                .get_mut(&key)
                .and_then(|categories| categories.get_mut(&category))
                .and_then(|connections| connections.shift_remove(&conn))
                .is_some();
            if removed {
                debug!("Unregister {} from {}/{}", conn, key, category);
            }
            providers_changed |= removed && category == PROVIDERS_CATEGORY;
        }

        Ok(if providers_changed {
            self.providers_changed(&tables, &key)
        } else {
            Vec::new()
        })
    }

    /// Subscribe `conn` to `url`'s categories
    ///
    /// Returns the notify list for the reply: a placeholder `empty://` URL
    /// followed by the current registrations of every requested category.
    pub async fn subscribe(&self, conn: SocketAddr, url: &ServiceUrl) -> Result<Vec<String>> {
        let key = require_service_key(url)?;
        let mut tables = self.tables.lock().await;
        let mut notify = vec![empty_placeholder(&key, url)];

        for category in url.categories() {
            tables
                .subscribers
                .entry(key.clone())
                .or_default()
                .entry(category.clone())
                .or_default()
                .insert(conn);

            if let Some(registered) = tables
                .registrations
                .get(&key)
                .and_then(|categories| categories.get(&category))
            {
                notify.extend(registered.values().cloned());
            }
        }

        info!("{} subscribed to {} ({} urls)", conn, key, notify.len() - 1);
        Ok(notify)
    }

    /// Drop `conn` from `url`'s category subscriptions
    pub async fn unsubscribe(&self, conn: SocketAddr, url: &ServiceUrl) -> Result<()> {
        let key = require_service_key(url)?;
        let mut tables = self.tables.lock().await;

        for category in url.categories() {
            if let Some(connections) = tables
                .subscribers
                .get_mut(&key)
                .and_then(|categories| categories.get_mut(&category))
            {
                connections.shift_remove(&conn);
            }
        }
        debug!("{} unsubscribed from {}", conn, key);
        Ok(())
    }

    /// Remove everything `conn` owns under `service_keys`
    ///
    /// Safe to call more than once for the same connection.
    pub async fn remove_connection(
        &self,
        conn: SocketAddr,
        service_keys: &HashSet<String>,
    ) -> Notifications {
        let mut tables = self.tables.lock().await;
        let mut notifications = Vec::new();

        for key in service_keys {
            if let Some(categories) = tables.subscribers.get_mut(key) {
                for connections in categories.values_mut() {
                    connections.shift_remove(&conn);
                }
            }

            let mut providers_changed = false;
            if let Some(categories) = tables.registrations.get_mut(key) {
                for (category, connections) in categories.iter_mut() {
                    let removed = connections.shift_remove(&conn).is_some();
                    providers_changed |= removed && category == PROVIDERS_CATEGORY;
                }
            }

            if providers_changed {
                notifications.extend(self.providers_changed(&tables, key));
            }
        }

        if !service_keys.is_empty() {
            info!("Removed {} service keys owned by {}", service_keys.len(), conn);
        }
        notifications
    }

    /// Full URL strings registered as providers of `service_key`
    pub async fn providers(&self, service_key: &str) -> Vec<String> {
        let tables = self.tables.lock().await;
        tables
            .registrations
            .get(service_key)
            .and_then(|categories| categories.get(PROVIDERS_CATEGORY))
            .map(|connections| connections.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Connections subscribed to `category` of `service_key`
    pub async fn subscribers(&self, service_key: &str, category: &str) -> Vec<SocketAddr> {
        let tables = self.tables.lock().await;
        tables
            .subscribers
            .get(service_key)
            .and_then(|categories| categories.get(category))
            .map(|connections| connections.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Build the legacy-map push for every provider subscriber of `key`
    fn providers_changed(&self, tables: &Tables, key: &str) -> Notifications {
        info!("Providers of {} changed, notifying consumers", key);

        let consumers = tables
            .subscribers
            .get(key)
            .and_then(|categories| categories.get(PROVIDERS_CATEGORY))
            .filter(|connections| !connections.is_empty());
        let Some(consumers) = consumers else {
            warn!("No consumers subscribed to {}", key);
            return Vec::new();
        };

        let providers = tables
            .registrations
            .get(key)
            .and_then(|categories| categories.get(PROVIDERS_CATEGORY))
            .filter(|connections| !connections.is_empty());
        let Some(providers) = providers else {
            warn!("No providers left for {}", key);
            return Vec::new();
        };

        // identity -> parameter string; later registrations at the same
        // address overwrite earlier ones
        let mut entries = IndexMap::new();
        for full in providers.values() {
            match ServiceUrl::value_of(full) {
                Ok(url) => {
                    entries.insert(url.to_identity_string(), url.to_parameter_string());
                }
                Err(e) => warn!("Skipping unparsable registration: {}", e),
            }
        }

        let reply = RegistryReply {
            notify: Some(NotifyPayload::LegacyMap(IndexMap::from([(
                key.to_string(),
                entries,
            )]))),
            ..RegistryReply::default()
        };
        let data = match serde_json::to_value(&reply) {
            Ok(data) => data,
            Err(e) => {
                warn!("Failed to encode notify for {}: {}", key, e);
                return Vec::new();
            }
        };

        consumers
            .iter()
            .map(|conn| {
                let id = self.next_push_id.fetch_add(1, Ordering::Relaxed);
                (*conn, Packet::push(id, data.clone()))
            })
            .collect()
    }
}

fn require_service_key(url: &ServiceUrl) -> Result<String> {
    url.service_key()
        .ok_or_else(|| Error::invalid_url(url.to_full_string(), "missing service interface"))
}

/// `empty://0.0.0.0/{serviceName}?category=configurators&version={version}`
fn empty_placeholder(key: &str, url: &ServiceUrl) -> String {
    let (name, version) = match key.split_once(':') {
        Some((name, version)) => (name, Some(version)),
        None => (key, url.parameter(VERSION_KEY)),
    };
    let mut placeholder = ServiceUrl::new(EMPTY_PROTOCOL, "0.0.0.0", 0, name)
        .with_parameter(CATEGORY_KEY, CONFIGURATORS_CATEGORY);
    if let Some(version) = version {
        placeholder = placeholder.with_parameter(VERSION_KEY, version);
    }
    placeholder.to_full_string()
}
