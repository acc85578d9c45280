//! Device and discovery collaborator traits.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Default broadcast target for discovery.
pub const DEFAULT_DISCOVERY_TARGET: &str = "255.255.255.255";

/// Default discovery listen window (3 seconds).
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(3);

/// Errors raised by device transports and discovery.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Network I/O error.
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Timeout elapsed.
    #[error("timeout elapsed")]
    Timeout,

    /// The device answered with something we could not interpret.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Response payload was not valid JSON.
    #[error("invalid response payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// A single loosely-typed telemetry value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Reading {
    Flag(bool),
    Number(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl Reading {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Flag(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Flag(b) => Some(*b),
            Self::Number(n) => Some(*n != 0.0),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    /// Convert a scalar JSON value. Arrays, objects and nulls have no reading.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(Self::Flag(*b)),
            serde_json::Value::Number(n) => n.as_f64().map(Self::Number),
            serde_json::Value::String(s) => Some(Self::Text(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flag(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
            Self::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
        }
    }
}

impl From<f64> for Reading {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<bool> for Reading {
    fn from(value: bool) -> Self {
        Self::Flag(value)
    }
}

impl From<&str> for Reading {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Reading {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<DateTime<Utc>> for Reading {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

/// Flat key-value telemetry snapshot.
pub type StateSnapshot = BTreeMap<String, Reading>;

/// Discovery credentials. Both secrets are opaque to this crate.
#[derive(Clone, Default)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(username: Option<String>, password: Option<String>) -> Self {
        Self { username, password }
    }

    pub fn is_empty(&self) -> bool {
        self.username.is_none() && self.password.is_none()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Network options for a discovery round.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Broadcast (or unicast) address the discovery request is sent to.
    pub target: String,
    /// How long to listen for replies.
    pub timeout: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            target: DEFAULT_DISCOVERY_TARGET.to_string(),
            timeout: DEFAULT_DISCOVERY_TIMEOUT,
        }
    }
}

/// A handle to one networked device.
///
/// Accessors read the snapshot taken by the last successful [`Device::refresh`].
#[async_trait::async_trait]
pub trait Device: Send + Sync + 'static {
    /// Network address; the registry key.
    fn address(&self) -> &str;

    /// Stable identifier reported by the device, if any.
    fn device_id(&self) -> Option<String>;

    /// User-assigned name.
    fn alias(&self) -> String;

    /// Hardware model.
    fn model(&self) -> String;

    /// Flat telemetry snapshot.
    fn state(&self) -> StateSnapshot;

    /// Named typed accessor. Defaults to the same-named state entry.
    fn feature(&self, name: &str) -> Option<Reading> {
        self.state().get(name).cloned()
    }

    /// Attribute lookup used for dimension labels without an accessor.
    fn attribute(&self, name: &str) -> Option<String> {
        match name {
            "alias" => Some(self.alias()),
            "model" => Some(self.model()),
            "address" => Some(self.address().to_string()),
            "device_id" => self.device_id(),
            _ => self.state().get(name).map(Reading::to_string),
        }
    }

    /// Pull fresh state from the device.
    async fn refresh(&self) -> Result<(), DeviceError>;

    /// Release the transport. Always safe to call.
    async fn disconnect(&self) -> Result<(), DeviceError>;
}

/// Devices found in one discovery round, keyed by address.
pub type DiscoveredDevices = HashMap<String, Arc<dyn Device>>;

/// Discovery collaborator.
#[async_trait::async_trait]
pub trait Discovery: Send + Sync + 'static {
    async fn discover(
        &self,
        credentials: &Credentials,
        options: &DiscoveryOptions,
    ) -> Result<DiscoveredDevices, DeviceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reading_conversions() {
        assert_eq!(Reading::Flag(true).as_f64(), Some(1.0));
        assert_eq!(Reading::Number(0.0).as_bool(), Some(false));
        assert_eq!(Reading::from("on").as_str(), Some("on"));
        assert_eq!(Reading::from("on").as_f64(), None);
    }

    #[test]
    fn test_reading_from_json() {
        assert_eq!(
            Reading::from_json(&serde_json::json!(-52)),
            Some(Reading::Number(-52.0))
        );
        assert_eq!(
            Reading::from_json(&serde_json::json!("1.0.3")),
            Some(Reading::Text("1.0.3".into()))
        );
        assert_eq!(Reading::from_json(&serde_json::json!({"a": 1})), None);
        assert_eq!(Reading::from_json(&serde_json::Value::Null), None);
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials::new(Some("user@example.com".into()), Some("hunter2".into()));
        let debug = format!("{creds:?}");
        assert!(debug.contains("user@example.com"));
        assert!(!debug.contains("hunter2"));
    }
}
