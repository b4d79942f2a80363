//! Server and client configuration.

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::NetworkError;
use crate::identity::ClientId;

/// How long a new connection may stay unregistered.
pub const DEFAULT_REGISTRATION_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a peer gets to finish the upgrade handshake, or to answer our
/// close frame, before the socket is dropped.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a blocking send waits for its response.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Who may connect to the server, and how they are identified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AccessPolicy {
    /// Listed hosts may connect; each names itself with a registration
    /// message before it can exchange anything else.
    Registration { allowed_hosts: BTreeSet<String> },
    /// Each listed host *is* a client identity. No registration step, and at
    /// most one live connection per identity.
    AddressBound { clients: BTreeMap<String, ClientId> },
}

impl AccessPolicy {
    /// Registration policy admitting `hosts`.
    pub fn registration<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Registration {
            allowed_hosts: hosts.into_iter().map(Into::into).collect(),
        }
    }

    /// Address-bound policy mapping host → identity.
    pub fn address_bound<I, S, C>(clients: I) -> Self
    where
        I: IntoIterator<Item = (S, C)>,
        S: Into<String>,
        C: Into<ClientId>,
    {
        Self::AddressBound {
            clients: clients
                .into_iter()
                .map(|(host, id)| (host.into(), id.into()))
                .collect(),
        }
    }

    /// Whether `host` appears in the allow-list at all.
    pub fn admits(&self, host: &str) -> bool {
        match self {
            Self::Registration { allowed_hosts } => allowed_hosts.contains(host),
            Self::AddressBound { clients } => clients.contains_key(host),
        }
    }
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self::registration(["127.0.0.1"])
    }
}

/// Configuration for the accepting side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the WebSocket listener to.
    pub bind_addr: IpAddr,

    /// Port to listen on. `0` picks a free port.
    pub port: u16,

    /// Allow-list and identification mode.
    pub access: AccessPolicy,

    /// How long a connection may stay in the waiting room.
    #[serde(with = "duration_ms_serde")]
    pub registration_timeout: Duration,

    /// Upper bound on the upgrade handshake and on waiting for a peer to
    /// answer a close frame.
    #[serde(with = "duration_ms_serde")]
    pub close_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 9470,
            access: AccessPolicy::default(),
            registration_timeout: DEFAULT_REGISTRATION_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

impl ServerConfig {
    /// The socket address to bind.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    /// Load config from a JSON file.
    pub fn load(path: &Path) -> Result<Self, NetworkError> {
        load_json(path)
    }

    /// Load config from a JSON file, or return defaults if the file is missing
    /// or unreadable.
    pub fn load_or_default(path: &Path) -> Self {
        load_json_or_default(path)
    }

    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), NetworkError> {
        save_json(self, path)
    }
}

/// Where a client finds its server: `ws://host:port/path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
    pub path: String,
    /// Use `wss://` instead of `ws://`.
    pub secure: bool,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16, path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            path: path.into(),
            secure: false,
        }
    }

    /// The WebSocket URL for this address.
    pub fn url(&self) -> Result<url::Url, NetworkError> {
        let scheme = if self.secure { "wss" } else { "ws" };
        let raw = format!(
            "{scheme}://{}:{}/{}",
            self.host,
            self.port,
            self.path.trim_start_matches('/')
        );
        url::Url::parse(&raw).map_err(|e| NetworkError::Config(format!("Invalid server address {raw}: {e}")))
    }
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self::new("localhost", 9470, "")
    }
}

/// Configuration for the connecting side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// The server to connect to.
    pub server: ServerAddress,

    /// How long a blocking send waits for its response.
    #[serde(with = "duration_ms_serde")]
    pub response_timeout: Duration,

    /// Timeout for establishing the connection.
    #[serde(with = "duration_ms_serde")]
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: ServerAddress::default(),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl ClientConfig {
    /// Client config pointing at `server` with default timeouts.
    pub fn for_server(server: ServerAddress) -> Self {
        Self {
            server,
            ..Self::default()
        }
    }

    /// Load config from a JSON file.
    pub fn load(path: &Path) -> Result<Self, NetworkError> {
        load_json(path)
    }

    /// Load config from a JSON file, or return defaults if the file is missing
    /// or unreadable.
    pub fn load_or_default(path: &Path) -> Self {
        load_json_or_default(path)
    }

    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), NetworkError> {
        save_json(self, path)
    }
}

// ---------------------------------------------------------------------------
// File helpers
// ---------------------------------------------------------------------------

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, NetworkError> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| NetworkError::Config(format!("Cannot read {}: {e}", path.display())))?;
    serde_json::from_str(&data)
        .map_err(|e| NetworkError::Config(format!("Corrupt config {}: {e}", path.display())))
}

fn load_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    if path.exists() {
        match load_json(path) {
            Ok(config) => return config,
            Err(e) => {
                tracing::warn!("{e}, using defaults");
            }
        }
    }
    T::default()
}

fn save_json<T: Serialize>(value: &T, path: &Path) -> Result<(), NetworkError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_server_config() {
        let config = ServerConfig::default();
        assert_eq!(config.listen_addr(), "127.0.0.1:9470".parse().unwrap());
        assert_eq!(config.registration_timeout, Duration::from_secs(5));
        assert_eq!(config.close_timeout, DEFAULT_CLOSE_TIMEOUT);
        assert!(config.access.admits("127.0.0.1"));
        assert!(!config.access.admits("10.0.0.1"));
    }

    #[test]
    fn test_server_config_json_shape() {
        let config: ServerConfig = serde_json::from_value(json!({
            "port": 7000,
            "access": {
                "mode": "address_bound",
                "clients": {"10.0.0.5": "lobby", "10.0.0.6": "survival"}
            },
            "registration_timeout": 2500,
            "close_timeout": 750
        }))
        .unwrap();

        assert_eq!(config.port, 7000);
        assert_eq!(config.bind_addr, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.registration_timeout, Duration::from_millis(2500));
        assert_eq!(config.close_timeout, Duration::from_millis(750));
        assert_eq!(
            config.access,
            AccessPolicy::address_bound([("10.0.0.5", "lobby"), ("10.0.0.6", "survival")])
        );
    }

    #[test]
    fn test_registration_policy_json_shape() {
        let policy = AccessPolicy::registration(["127.0.0.1", "10.1.1.1"]);
        let value = serde_json::to_value(&policy).unwrap();
        assert_eq!(
            value,
            json!({"mode": "registration", "allowed_hosts": ["10.1.1.1", "127.0.0.1"]})
        );
    }

    #[test]
    fn test_server_address_url() {
        let addr = ServerAddress::new("localhost", 8025, "arrival");
        assert_eq!(addr.url().unwrap().as_str(), "ws://localhost:8025/arrival");

        let mut secure = ServerAddress::new("play.example.net", 8443, "/ws");
        secure.secure = true;
        assert_eq!(secure.url().unwrap().as_str(), "wss://play.example.net:8443/ws");

        let bad = ServerAddress::new("not a host", 1, "");
        assert!(matches!(bad.url(), Err(NetworkError::Config(_))));
    }

    #[test]
    fn test_config_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("server.json");

        let mut original = ServerConfig::default();
        original.port = 9999;
        original.access = AccessPolicy::registration(["192.168.1.100"]);
        original.save_to_file(&path).unwrap();

        let loaded = ServerConfig::load(&path).unwrap();
        assert_eq!(loaded.port, 9999);
        assert_eq!(loaded.access, original.access);
    }

    #[test]
    fn test_config_load_missing_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");

        let config = ClientConfig::load_or_default(&path);
        assert_eq!(config.response_timeout, DEFAULT_RESPONSE_TIMEOUT);
        assert!(matches!(ClientConfig::load(&path), Err(NetworkError::Config(_))));
    }

    #[test]
    fn test_config_load_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(ClientConfig::load(&path), Err(NetworkError::Config(_))));
        let config = ClientConfig::load_or_default(&path);
        assert_eq!(config.server, ServerAddress::default());
    }
}
