//! Data models shared by the registry client and server

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Describes a service to subscribe to or publish
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDescriptor {
    /// Fully qualified interface name
    pub interface_name: String,
    /// Service version
    pub version: String,
    /// Optional service group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Export URL, required when publishing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl ServiceDescriptor {
    /// Create a descriptor for `interface_name` at `version`
    pub fn new(interface_name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            interface_name: interface_name.into(),
            version: version.into(),
            group: None,
            url: None,
        }
    }

    /// Set the service group
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Set the export URL
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// `group/interface` or just `interface`
    pub fn path(&self) -> String {
        match self.group() {
            Some(group) => format!("{}/{}", group, self.interface_name),
            None => self.interface_name.clone(),
        }
    }

    /// The group, ignoring an empty string
    pub fn group(&self) -> Option<&str> {
        self.group.as_deref().filter(|group| !group.is_empty())
    }

    /// Check the fields every operation needs
    pub fn validate(&self, operation: &str) -> Result<()> {
        if self.interface_name.trim().is_empty() {
            return Err(Error::InvalidDescriptor(format!(
                "{operation}: interface name is required"
            )));
        }
        if self.version.trim().is_empty() {
            return Err(Error::InvalidDescriptor(format!(
                "{operation}: version is required"
            )));
        }
        Ok(())
    }
}

/// A registry node address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegistryAddress {
    /// Host name or IP
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl RegistryAddress {
    /// Create an address
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host[:port]`, using `default_port` when the port is omitted
    pub fn parse(input: &str, default_port: u16) -> Result<Self> {
        let input = input.trim();
        match input.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse().map_err(|_| {
                    Error::InvalidDescriptor(format!("invalid registry address {input:?}"))
                })?;
                Ok(Self::new(host, port))
            }
            None if !input.is_empty() => Ok(Self::new(input, default_port)),
            None => Err(Error::InvalidDescriptor(
                "empty registry address".to_string(),
            )),
        }
    }

    /// Parse a comma-separated list of addresses
    pub fn parse_list(input: &str, default_port: u16) -> Result<Vec<Self>> {
        input
            .split(',')
            .filter(|addr| !addr.trim().is_empty())
            .map(|addr| Self::parse(addr, default_port))
            .collect()
    }
}

impl fmt::Display for RegistryAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Callback receiving the current provider URL list of a service
pub type Listener = Arc<dyn Fn(&[String]) + Send + Sync>;

/// Handle identifying one attached listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

/// Session-level events observable by callers
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Logged in to a registry node
    LoggedIn(RegistryAddress),
    /// A non-fatal error; the session keeps retrying
    Error(Arc<Error>),
}
