//! Addressable service URL model
//!
//! A [`ServiceUrl`] describes one endpoint of a service (a provider address,
//! a consumer's interest, a router rule, ...) together with its parameters.
//! Two URLs with the same [`ServiceUrl::service_key`] address the same logical
//! service.
//!
//! ```
//! use dubbo_registry::ServiceUrl;
//!
//! let url: ServiceUrl = "dubbo://127.0.0.1:12200/com.demo.DemoService?version=1.0.0&group=blue"
//!     .parse()
//!     .unwrap();
//! assert_eq!(url.service_key().as_deref(), Some("blue/com.demo.DemoService:1.0.0"));
//! ```

use crate::error::{Error, Result};
use indexmap::IndexMap;
use std::fmt;
use std::str::FromStr;

/// Parameter holding the service interface name
pub const INTERFACE_KEY: &str = "interface";
/// Parameter holding the service group
pub const GROUP_KEY: &str = "group";
/// Parameter holding the service version
pub const VERSION_KEY: &str = "version";
/// Parameter holding the comma-separated registration categories
pub const CATEGORY_KEY: &str = "category";
/// Prefix consulted when a plain parameter is absent
pub const DEFAULT_KEY_PREFIX: &str = "default.";

/// Provider registrations
pub const PROVIDERS_CATEGORY: &str = "providers";
/// Consumer registrations
pub const CONSUMERS_CATEGORY: &str = "consumer";
/// Routing rules
pub const ROUTERS_CATEGORY: &str = "routers";
/// Dynamic configuration rules
pub const CONFIGURATORS_CATEGORY: &str = "configurators";
/// Category assumed when a URL carries none
pub const DEFAULT_CATEGORY: &str = PROVIDERS_CATEGORY;

/// Scheme used by dynamic override rules
pub const OVERRIDE_PROTOCOL: &str = "override";
/// Scheme of the placeholder sent when a service has no providers yet
pub const EMPTY_PROTOCOL: &str = "empty";

/// A service endpoint and its parameters
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceUrl {
    /// Scheme, e.g. `dubbo`, `consumer`, `empty`
    pub protocol: String,
    /// Optional user name
    pub username: Option<String>,
    /// Optional password
    pub password: Option<String>,
    /// Host name or address
    pub host: String,
    /// Port, `0` when unspecified
    pub port: u16,
    /// Path without a leading `/`, empty when absent
    path: String,
    /// Query parameters, insertion ordered
    pub parameters: IndexMap<String, String>,
}

impl ServiceUrl {
    /// Create a URL from its fields; a leading `/` on `path` is dropped
    pub fn new(
        protocol: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        path: impl AsRef<str>,
    ) -> Self {
        Self {
            protocol: protocol.into(),
            username: None,
            password: None,
            host: host.into(),
            port,
            path: normalize_path(path.as_ref()),
            parameters: IndexMap::new(),
        }
    }

    /// Parse a fully-qualified URL string
    pub fn value_of(input: &str) -> Result<Self> {
        let (protocol, rest) = input
            .split_once("://")
            .ok_or_else(|| Error::invalid_url(input, "missing scheme separator"))?;
        if protocol.is_empty() {
            return Err(Error::invalid_url(input, "empty scheme"));
        }

        let (rest, query) = match rest.split_once('?') {
            Some((rest, query)) => (rest, Some(query)),
            None => (rest, None),
        };
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };
        let (auth, host_port) = match authority.rsplit_once('@') {
            Some((auth, host_port)) => (Some(auth), host_port),
            None => (None, authority),
        };
        let (host, port) = split_host_port(input, host_port)?;

        let mut url = Self::new(protocol, host, port, decode_component(path));
        url.set_auth(auth);
        if let Some(query) = query {
            url.parameters = parse_query(query);
        }
        Ok(url)
    }

    /// Path without a leading separator
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Replace the path, normalizing away a leading separator
    pub fn set_path(&mut self, path: impl AsRef<str>) {
        self.path = normalize_path(path.as_ref());
    }

    /// `user:pass` form of the credentials, if any are set
    pub fn auth(&self) -> Option<String> {
        if self.username.is_none() && self.password.is_none() {
            return None;
        }
        Some(format!(
            "{}:{}",
            self.username.as_deref().unwrap_or_default(),
            self.password.as_deref().unwrap_or_default()
        ))
    }

    /// Split `user:pass` into credentials; `None` leaves them untouched
    pub fn set_auth(&mut self, auth: Option<&str>) {
        let Some(auth) = auth.filter(|auth| !auth.is_empty()) else {
            return;
        };
        let (username, password) = match auth.split_once(':') {
            Some((username, password)) => (username, password),
            None => (auth, ""),
        };
        self.username = Some(decode_component(username));
        self.password = Some(decode_component(password));
    }

    /// `host[:port]`, omitting an unspecified port
    pub fn address(&self) -> String {
        if self.port == 0 {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Look up a parameter, falling back to its `default.`-prefixed form
    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters
            .get(key)
            .or_else(|| self.parameters.get(&format!("{DEFAULT_KEY_PREFIX}{key}")))
            .map(String::as_str)
    }

    /// Like [`ServiceUrl::parameter`], with a caller-supplied fallback
    pub fn parameter_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.parameter(key).unwrap_or(default)
    }

    /// Return a copy with `key` set to `value`; the receiver is unchanged
    pub fn with_parameter(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut url = self.clone();
        url.parameters.insert(key.into(), value.into());
        url
    }

    /// Return a copy with every pair merged in; the receiver is unchanged
    pub fn with_parameters<K, V>(&self, parameters: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut url = self.clone();
        url.parameters
            .extend(parameters.into_iter().map(|(k, v)| (k.into(), v.into())));
        url
    }

    /// Interface name: the `interface` parameter, else the path
    pub fn service_interface(&self) -> Option<&str> {
        let interface = match self.parameters.get(INTERFACE_KEY) {
            Some(interface) => interface.as_str(),
            None => self.path.as_str(),
        };
        (!interface.is_empty()).then_some(interface)
    }

    /// `[group/]interface[:version]`, or `None` when no interface is known
    pub fn service_key(&self) -> Option<String> {
        let interface = self.service_interface()?;
        let mut key = String::new();
        if let Some(group) = self.parameter(GROUP_KEY).filter(|g| !g.is_empty()) {
            key.push_str(group);
            key.push('/');
        }
        key.push_str(interface);
        if let Some(version) = self.parameter(VERSION_KEY).filter(|v| !v.is_empty()) {
            key.push(':');
            key.push_str(version);
        }
        Some(key)
    }

    /// Categories listed in the `category` parameter
    pub fn categories(&self) -> Vec<String> {
        self.parameter_or(CATEGORY_KEY, DEFAULT_CATEGORY)
            .split(',')
            .map(str::trim)
            .filter(|category| !category.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// `scheme://host[:port]`, without path or parameters
    pub fn to_identity_string(&self) -> String {
        format!("{}://{}", self.protocol, self.address())
    }

    /// Parameters rendered as a query string
    pub fn to_parameter_string(&self) -> String {
        self.parameters
            .iter()
            .map(|(key, value)| format!("{}={}", encode_component(key), encode_component(value)))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// The complete canonical URL
    pub fn to_full_string(&self) -> String {
        let mut out = format!("{}://", self.protocol);
        if let Some(username) = &self.username {
            out.push_str(&encode_component(username));
            if let Some(password) = self.password.as_deref().filter(|p| !p.is_empty()) {
                out.push(':');
                out.push_str(&encode_component(password));
            }
            out.push('@');
        }
        out.push_str(&self.address());
        if !self.path.is_empty() {
            out.push('/');
            out.push_str(&encode_path(&self.path));
        }
        if !self.parameters.is_empty() {
            out.push('?');
            out.push_str(&self.to_parameter_string());
        }
        out
    }
}

impl fmt::Display for ServiceUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_full_string())
    }
}

impl FromStr for ServiceUrl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::value_of(s)
    }
}

fn normalize_path(path: &str) -> String {
    path.strip_prefix('/').unwrap_or(path).to_string()
}

fn split_host_port(input: &str, host_port: &str) -> Result<(String, u16)> {
    // Bracketed IPv6 literal
    if let Some(rest) = host_port.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| Error::invalid_url(input, "unterminated IPv6 literal"))?;
        let port = match tail.strip_prefix(':') {
            Some(port) => parse_port(input, port)?,
            None => 0,
        };
        return Ok((format!("[{host}]"), port));
    }

    match host_port.rsplit_once(':') {
        Some((host, port)) => Ok((host.to_string(), parse_port(input, port)?)),
        None => Ok((host_port.to_string(), 0)),
    }
}

fn parse_port(input: &str, port: &str) -> Result<u16> {
    if port.is_empty() {
        return Ok(0);
    }
    port.parse()
        .map_err(|_| Error::invalid_url(input, format!("invalid port {port:?}")))
}

fn parse_query(query: &str) -> IndexMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (decode_component(key), decode_component(value)),
            None => (decode_component(pair), String::new()),
        })
        .collect()
}

fn is_unreserved(byte: u8) -> bool {
    byte.is_ascii_alphanumeric()
        || matches!(byte, b'-' | b'_' | b'.' | b'!' | b'~' | b'*' | b'\'' | b'(' | b')')
}

/// Percent-encode a query component
pub(crate) fn encode_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        if is_unreserved(byte) {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn encode_path(path: &str) -> String {
    path.split('/')
        .map(encode_component)
        .collect::<Vec<_>>()
        .join("/")
}

/// Decode a percent-encoded component, treating `+` as a space
pub(crate) fn decode_component(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                (Some(high), Some(low)) => {
                    out.push(high << 4 | low);
                    i += 2;
                }
                _ => out.push(b'%'),
            },
            other => out.push(other),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(byte: u8) -> Option<u8> {
    (byte as char).to_digit(16).map(|digit| digit as u8)
}
