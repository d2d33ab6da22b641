use std::collections::HashMap;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use crate::protocol::{DEFAULT_PORT, IDENTITY_SEPARATOR};

/// A process registered under a service name.
/// This is the canonical data model written to the registry namespace and handed to callers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Instance {
    /// UUID assigned once at first registration
    #[serde(default)]
    pub id: String,

    /// Address other processes should use, e.g. "10.0.0.7"
    #[serde(default)]
    pub host: String,

    /// OS hostname of the registering process
    #[serde(default, rename = "host_name")]
    pub hostname: String,

    /// Service port
    #[serde(default)]
    pub port: u16,

    /// Service name, usually used as the routing key
    #[serde(default)]
    pub service_name: String,

    /// Free-form metadata
    #[serde(default)]
    pub meta: HashMap<String, serde_json::Value>,

    /// When the defaults were filled in for registration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_at: Option<DateTime<Utc>>,
}

impl Instance {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Self::default()
        }
    }

    pub fn with_address(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    /// Merge metadata into the instance, overwriting existing keys
    pub fn with_meta<K, V>(mut self, meta: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<serde_json::Value>,
    {
        self.meta
            .extend(meta.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Deterministic identity: `<service_name>_<id>@<host>`
    pub fn identity(&self) -> String {
        format!(
            "{}{}{}@{}",
            self.service_name, IDENTITY_SEPARATOR, self.id, self.host
        )
    }

    /// Fill whatever the caller left empty before the first registration.
    /// An existing id is never replaced.
    pub fn fill_defaults(&mut self) {
        if self.id.is_empty() {
            self.id = uuid::Uuid::new_v4().to_string();
        }
        if self.hostname.is_empty() {
            self.hostname = hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_default();
        }
        if self.port == 0 {
            self.port = DEFAULT_PORT;
        }
        // Interface discovery is left to the caller; the hostname is the fallback address
        if self.host.is_empty() {
            self.host = self.hostname.clone();
        }
        if self.registered_at.is_none() {
            self.registered_at = Some(Utc::now());
        }
    }
}
