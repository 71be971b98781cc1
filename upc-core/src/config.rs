//! Connector settings. Embedded by hosts in their own config file.

use serde::{Deserialize, Serialize};

use crate::protocol::INSTANCE_DEFAULT;

/// How private keys are protected at rest. Chosen once at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStorage {
    /// Sealed under a wrapping key held in the OS keyring.
    #[default]
    Keyring,
    /// Stored in the clear inside the store image.
    Plain,
}

impl std::str::FromStr for KeyStorage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "keyring" => Ok(KeyStorage::Keyring),
            "plain" => Ok(KeyStorage::Plain),
            other => Err(format!("unknown key storage {other:?}")),
        }
    }
}

/// Connector configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectorConfig {
    /// Application id sent with REGISTER / UNREGISTER.
    #[serde(default = "default_application")]
    pub application: String,
    /// Instance used when the host does not name one.
    #[serde(default = "default_instance")]
    pub default_instance: String,
    /// Reject `register` without a VAPID key.
    #[serde(default)]
    pub require_vapid: bool,
    #[serde(default)]
    pub key_storage: KeyStorage,
}

fn default_application() -> String {
    "org.unifiedpush.connector".to_string()
}
fn default_instance() -> String {
    INSTANCE_DEFAULT.to_string()
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            application: default_application(),
            default_instance: default_instance(),
            require_vapid: false,
            key_storage: KeyStorage::default(),
        }
    }
}

impl ConnectorConfig {
    pub fn with_application(application: impl Into<String>) -> Self {
        Self {
            application: application.into(),
            ..Self::default()
        }
    }
}
