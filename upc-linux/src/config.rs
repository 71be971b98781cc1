//! Load config from file and environment.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use upc_core::{ConnectorConfig, KeyStorage, PeerProtocol};

/// A distributor reachable over a Unix socket.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DistributorConfig {
    pub id: String,
    pub socket: PathBuf,
    #[serde(default = "default_protocol")]
    pub protocol: PeerProtocol,
    #[serde(default)]
    pub features: Vec<String>,
}

fn default_protocol() -> PeerProtocol {
    PeerProtocol::Handshake
}

/// Daemon configuration. File: ~/.config/upc/config.toml or /etc/upc/config.toml.
/// Env overrides: UPC_STORE_PATH, UPC_DISTRIBUTOR_SOCKET, UPC_APPLICATION, UPC_KEY_STORAGE.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Store image (default ~/.local/share/upc/store.json).
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    /// Distributor to bind; when unset and exactly one candidate exists it is used.
    #[serde(default)]
    pub distributor: Option<String>,
    /// Features a distributor must advertise to be a candidate.
    #[serde(default)]
    pub required_features: Vec<String>,
    /// Seconds between peer directory scans (default 10).
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
    /// VAPID public key sent when registering the default instance.
    #[serde(default)]
    pub vapid: Option<String>,
    #[serde(default)]
    pub distributors: Vec<DistributorConfig>,
    #[serde(default)]
    pub connector: ConnectorConfig,
}

fn default_store_path() -> PathBuf {
    let data = std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share")));
    match data {
        Some(d) => d.join("upc/store.json"),
        None => PathBuf::from("/var/lib/upc/store.json"),
    }
}
fn default_scan_interval() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            distributor: None,
            required_features: Vec::new(),
            scan_interval_secs: default_scan_interval(),
            vapid: None,
            distributors: Vec::new(),
            connector: ConnectorConfig::default(),
        }
    }
}

/// Id given to the distributor defined through UPC_DISTRIBUTOR_SOCKET.
pub const ENV_DISTRIBUTOR_ID: &str = "env";

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |k| std::env::var(k).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("UPC_STORE_PATH") {
        c.store_path = PathBuf::from(p);
    }
    if let Some(app) = var("UPC_APPLICATION") {
        c.connector.application = app;
    }
    if let Some(s) = var("UPC_KEY_STORAGE") {
        match s.parse::<KeyStorage>() {
            Ok(k) => c.connector.key_storage = k,
            Err(e) => log::warn!("ignoring UPC_KEY_STORAGE: {}", e),
        }
    }
    if let Some(socket) = var("UPC_DISTRIBUTOR_SOCKET") {
        c.distributors.retain(|d| d.id != ENV_DISTRIBUTOR_ID);
        c.distributors.push(DistributorConfig {
            id: ENV_DISTRIBUTOR_ID.to_string(),
            socket: PathBuf::from(socket),
            protocol: default_protocol(),
            features: Vec::new(),
        });
        c.distributor = Some(ENV_DISTRIBUTOR_ID.to_string());
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/upc/config.toml"));
    }
    out.push(PathBuf::from("/etc/upc/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    parse_file(&path)
}

fn parse_file(path: &Path) -> Option<Config> {
    let s = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            log::warn!("cannot read {}: {}", path.display(), e);
            return None;
        }
    };
    match toml::from_str::<Config>(&s) {
        Ok(c) => Some(c),
        Err(e) => {
            log::warn!("invalid config {}, using defaults: {}", path.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_with_distributors_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
store_path = "/tmp/upc.json"
distributor = "sun"
required_features = ["org.unifiedpush.android.distributor.feature.BYTES_MESSAGE"]

[connector]
application = "org.example.chat"
key_storage = "plain"

[[distributors]]
id = "sun"
socket = "/run/user/1000/sun.sock"

[[distributors]]
id = "old"
socket = "/run/old.sock"
protocol = "legacy"
"#,
        )
        .unwrap();
        let c = parse_file(&path).unwrap();
        assert_eq!(c.store_path, PathBuf::from("/tmp/upc.json"));
        assert_eq!(c.distributor.as_deref(), Some("sun"));
        assert_eq!(c.connector.application, "org.example.chat");
        assert_eq!(c.connector.key_storage, KeyStorage::Plain);
        assert_eq!(c.distributors[0].protocol, PeerProtocol::Handshake);
        assert_eq!(c.distributors[1].protocol, PeerProtocol::Legacy);
        assert_eq!(c.scan_interval_secs, 10);
    }

    #[test]
    fn invalid_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "unknown_key = 1").unwrap();
        assert!(parse_file(&path).is_none());
    }

    #[test]
    fn env_overrides_apply() {
        let mut c = Config::default();
        apply_env(&mut c, |k| match k {
            "UPC_STORE_PATH" => Some("/data/store.json".into()),
            "UPC_APPLICATION" => Some("org.example.env".into()),
            "UPC_KEY_STORAGE" => Some("plain".into()),
            "UPC_DISTRIBUTOR_SOCKET" => Some("/run/d.sock".into()),
            _ => None,
        });
        assert_eq!(c.store_path, PathBuf::from("/data/store.json"));
        assert_eq!(c.connector.application, "org.example.env");
        assert_eq!(c.connector.key_storage, KeyStorage::Plain);
        assert_eq!(c.distributor.as_deref(), Some(ENV_DISTRIBUTOR_ID));
        assert_eq!(c.distributors.len(), 1);
        assert_eq!(c.distributors[0].socket, PathBuf::from("/run/d.sock"));
    }

    #[test]
    fn bad_key_storage_env_ignored() {
        let mut c = Config::default();
        apply_env(&mut c, |k| (k == "UPC_KEY_STORAGE").then(|| "vault".to_string()));
        assert_eq!(c.connector.key_storage, KeyStorage::Keyring);
    }
}
