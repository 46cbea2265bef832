//! Dubbo-style service registry over WebSocket
//!
//! This crate provides both halves of a service registry:
//!
//! - [`RegistryClient`] keeps a logged-in session with one node of a
//!   registry cluster, publishes providers, subscribes to provider lists
//!   and survives node loss by failing over and replaying its state.
//! - [`RegistryServer`] tracks registrations and subscriptions per
//!   connection and pushes provider changes to subscribed consumers.
//!
//! Packets are JSON objects carried in WebSocket text frames. Everything
//! runs on `smol`; networking uses `async-net` and `async-tungstenite`.
//!
//! # Example
//!
//! ```no_run
//! use dubbo_registry::{ClientConfig, RegistryClient, ServiceDescriptor};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let client = RegistryClient::new(ClientConfig::new("127.0.0.1:9090", "demo")).await?;
//! client.ready().await?;
//!
//! let service = ServiceDescriptor::new("com.example.DemoService", "1.0.0");
//! client
//!     .subscribe(&service, |providers| println!("{} providers", providers.len()))
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod cache;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod models;
pub mod protocol;
pub mod registry;
pub mod retry;
pub mod server;
pub mod url;

pub use cache::{CacheEntry, LocalCache};
pub use client::RegistryClient;
pub use config::{ClientConfig, DEFAULT_REGISTRY_PORT, RegistryConfig, ServerConfig};
pub use error::{Error, Result};
pub use models::*;
pub use registry::Registry;
pub use server::RegistryServer;
pub use url::ServiceUrl;
