use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::Context;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::fs;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const DEFAULT_CERT_FILE: &str = "cert.pem";
pub const DEFAULT_KEY_FILE: &str = "key.pem";

/// Route configuration, read from the `-C` file and extended from the
/// command line.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RouteConfig {
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub serve_nodes: Vec<String>,
    #[serde(default)]
    pub chain_nodes: Vec<String>,
    #[serde(default)]
    pub routes: Vec<RouteGroup>,
    #[serde(default = "default_cert_file")]
    pub cert_file: PathBuf,
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            debug: false,
            serve_nodes: Vec::new(),
            chain_nodes: Vec::new(),
            routes: Vec::new(),
            cert_file: default_cert_file(),
            key_file: default_key_file(),
        }
    }
}

fn default_cert_file() -> PathBuf {
    PathBuf::from(DEFAULT_CERT_FILE)
}

fn default_key_file() -> PathBuf {
    PathBuf::from(DEFAULT_KEY_FILE)
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
pub struct RouteGroup {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub serve_nodes: Vec<String>,
    #[serde(default)]
    pub chain_nodes: Vec<String>,
}

impl RouteConfig {
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read configuration file \"{}\"", path.display()))?;
        let config = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse configuration file \"{}\"", path.display()))?;
        log::info!("loaded route configuration from \"{}\"", path.display());
        Ok(config)
    }

    /// The unnamed route made of the top-level serve and chain nodes.
    pub fn base_route(&self) -> RouteGroup {
        RouteGroup {
            name: String::from("base"),
            serve_nodes: self.serve_nodes.clone(),
            chain_nodes: self.chain_nodes.clone(),
        }
    }
}

/// Client configuration carried by the `-A` blob.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct TunnelConfig {
    #[serde(default)]
    pub log: LogSettings,
    #[serde(default)]
    pub clients: Vec<ClientDefinition>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LogSettings {
    #[serde(default)]
    pub way: LogWay,
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Number of rolled log files kept next to the live one.
    #[serde(default = "default_log_max_days")]
    pub max_days: u32,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            way: LogWay::default(),
            file: None,
            level: default_log_level(),
            max_days: default_log_max_days(),
        }
    }
}

fn default_log_level() -> String {
    String::from("info")
}

fn default_log_max_days() -> u32 {
    3
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogWay {
    #[default]
    Console,
    File,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ClientDefinition {
    pub name: String,
    pub server_addr: String,
    #[serde(default)]
    pub auth_token: Secret,
    #[serde(default)]
    pub proxies: Vec<ProxyMapping>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ProxyMapping {
    pub name: String,
    pub local_addr: String,
    #[serde(default)]
    pub remote_name: String,
}

impl TunnelConfig {
    /// Decodes the auth blob and parses the client configuration it carries.
    /// An empty blob yields an empty configuration.
    pub fn from_auth_blob(blob: &str) -> anyhow::Result<Self> {
        let text = decode_blob(blob);
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self =
            serde_json::from_str(&text).context("failed to parse client configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let mut names = HashSet::new();
        for client in &self.clients {
            anyhow::ensure!(!client.name.is_empty(), "client with empty name");
            anyhow::ensure!(
                names.insert(client.name.as_str()),
                "duplicate client \"{}\"",
                client.name
            );
            anyhow::ensure!(
                !client.server_addr.is_empty(),
                "client \"{}\" has no server address",
                client.name
            );
            for proxy in &client.proxies {
                anyhow::ensure!(
                    !proxy.local_addr.is_empty(),
                    "proxy \"{}\" of client \"{}\" has no local address",
                    proxy.name,
                    client.name
                );
            }
        }
        Ok(())
    }
}

/// Base64 decoding that falls back to the raw text when the blob is not
/// valid base64 or does not decode to UTF-8.
pub fn decode_blob(blob: &str) -> String {
    base64::engine::general_purpose::STANDARD
        .decode(blob.trim())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| blob.to_owned())
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Secret,
}

#[derive(Serialize, Deserialize, Clone, Default, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl FromStr for Secret {
    type Err = std::convert::Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(value))
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("<secret>").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(text: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(text)
    }

    #[test]
    fn default_parse_test() {
        let config: serde_json::Result<RouteConfig> =
            serde_json::from_str("{\"serve_nodes\":[\"http://:8080\"]}");
        let config = config.unwrap();
        assert_eq!(config.serve_nodes, ["http://:8080"]);
        assert_eq!(config.cert_file, PathBuf::from(DEFAULT_CERT_FILE));
        assert_eq!(config.key_file, PathBuf::from(DEFAULT_KEY_FILE));
    }

    #[tokio::test]
    async fn load_route_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routes.json");
        std::fs::write(
            &path,
            r#"{"debug": true, "serve_nodes": ["tcp://:2222/10.0.0.5:22"],
                "routes": [{"name": "office", "serve_nodes": ["http://:3128"]}]}"#,
        )
        .unwrap();
        let config = RouteConfig::load(&path).await.unwrap();
        assert!(config.debug);
        assert_eq!(config.routes.len(), 1);
        assert_eq!(config.routes[0].name, "office");
        assert_eq!(config.base_route().serve_nodes, ["tcp://:2222/10.0.0.5:22"]);
    }

    #[tokio::test]
    async fn missing_route_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let error = RouteConfig::load(&dir.path().join("absent.json"))
            .await
            .unwrap_err();
        assert!(format!("{:#}", error).contains("absent.json"));
    }

    #[test]
    fn blob_falls_back_to_raw_text() {
        assert_eq!(decode_blob(&encode("{\"clients\":[]}")), "{\"clients\":[]}");
        assert_eq!(decode_blob("{not base64}"), "{not base64}");
    }

    #[test]
    fn empty_blob_has_no_clients() {
        let config = TunnelConfig::from_auth_blob("").unwrap();
        assert!(config.clients.is_empty());
        assert_eq!(config.log.way, LogWay::Console);
        assert_eq!(config.log.level, "info");
        assert_eq!(config.log.max_days, 3);
    }

    #[test]
    fn blob_with_clients() {
        let text = r#"{
            "log": {"way": "file", "file": "/tmp/tunvisor.log", "level": "debug", "max_days": 7},
            "clients": [{
                "name": "ssh",
                "server_addr": "relay.example.com:7000",
                "auth_token": "hunter2",
                "proxies": [{"name": "ssh", "local_addr": "127.0.0.1:22", "remote_name": "dev-ssh"}]
            }]
        }"#;
        let config = TunnelConfig::from_auth_blob(&encode(text)).unwrap();
        assert_eq!(config.log.way, LogWay::File);
        assert_eq!(config.log.max_days, 7);
        assert_eq!(config.clients.len(), 1);
        let client = &config.clients[0];
        assert_eq!(client.auth_token.expose(), "hunter2");
        assert_eq!(client.proxies[0].remote_name, "dev-ssh");
        assert!(!format!("{:?}", client).contains("hunter2"));
    }

    #[test]
    fn duplicate_clients_are_rejected() {
        let text = r#"{"clients": [
            {"name": "a", "server_addr": "relay:7000"},
            {"name": "a", "server_addr": "relay:7001"}
        ]}"#;
        let error = TunnelConfig::from_auth_blob(text).unwrap_err();
        assert!(error.to_string().contains("duplicate client"));
    }

    #[test]
    fn client_without_server_is_rejected() {
        let text = r#"{"clients": [{"name": "a", "server_addr": ""}]}"#;
        assert!(TunnelConfig::from_auth_blob(text).is_err());
    }

    #[test]
    fn malformed_blob_is_an_error() {
        assert!(TunnelConfig::from_auth_blob(&encode("{\"clients\": 1}")).is_err());
    }
}
