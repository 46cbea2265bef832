//! Registry payloads carried inside packets

use crate::url::ServiceUrl;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Protocol version advertised by both sides
pub const DUBBO_VERSION: &str = "2.5.3";

/// Credentials and identity sent on login
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginInfo {
    /// Optional user name
    #[serde(default)]
    pub username: Option<String>,
    /// Optional password
    #[serde(default)]
    pub password: Option<String>,
    /// Application name of the client
    #[serde(default)]
    pub application: Option<String>,
    /// Client protocol version
    #[serde(default)]
    pub protocol_version: Option<String>,
}

/// URL carried by register/unregister/subscribe/unsubscribe requests
///
/// Registries that never reported a protocol version only understand the
/// `{serviceKey: parameterString}` form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UrlPayload {
    /// Full URL string
    Full(String),
    /// `serviceKey -> parameter string`
    Legacy(IndexMap<String, String>),
}

impl UrlPayload {
    /// Encode `url` for a registry that reported `registry_version`
    pub fn for_registry(url: &ServiceUrl, registry_version: Option<&str>) -> Self {
        match (registry_version, url.service_key()) {
            (None, Some(key)) => Self::Legacy(IndexMap::from([(key, url.to_parameter_string())])),
            _ => Self::Full(url.to_full_string()),
        }
    }
}

impl From<String> for UrlPayload {
    fn from(url: String) -> Self {
        Self::Full(url)
    }
}

/// Request payloads understood by the registry server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryRequest {
    /// Session handshake
    Login(LoginInfo),
    /// Add a URL to the registration table
    Register(UrlPayload),
    /// Remove a URL from the registration table
    Unregister(UrlPayload),
    /// Express interest in a service's categories
    Subscribe(UrlPayload),
    /// Withdraw interest in a service
    Unsubscribe(UrlPayload),
}

impl RegistryRequest {
    /// Verb used in log lines
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Login(_) => "login",
            Self::Register(_) => "register",
            Self::Unregister(_) => "unregister",
            Self::Subscribe(_) => "subscribe",
            Self::Unsubscribe(_) => "unsubscribe",
        }
    }
}

/// Outcome reported inside a reply payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    /// Accepted
    Ok,
    /// Rejected
    Failed,
}

/// Provider data pushed to consumers
///
/// `UrlList` is a list of fully-qualified URL strings. `LegacyMap` nests
/// `dataId -> identity URL -> parameter string`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NotifyPayload {
    /// Fully-qualified URL strings
    UrlList(Vec<String>),
    /// `dataId -> identity -> parameters`
    LegacyMap(IndexMap<String, IndexMap<String, String>>),
}

/// Reply or push payload produced by the registry server
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryReply {
    /// Outcome of the request, absent on pushes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ReplyStatus>,
    /// Registry protocol version, sent on login
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
    /// Replacement list of alternate registry addresses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync: Option<Vec<String>>,
    /// Provider data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify: Option<NotifyPayload>,
    /// Server-side error message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RegistryReply {
    /// `{status: "ok"}`
    pub fn ok() -> Self {
        Self {
            status: Some(ReplyStatus::Ok),
            ..Self::default()
        }
    }

    /// Whether the reply reports success
    pub fn is_ok(&self) -> bool {
        self.status == Some(ReplyStatus::Ok)
    }
}
