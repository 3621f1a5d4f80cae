// Configuration for the Passage CLI
//
// Stored cross-platform in:
// - macOS/Linux: ~/.config/passage/config.toml
// - Windows: %APPDATA%\passage\config.toml
//
// Environment variables override the file: PASSAGE_RENDEZVOUS_URL,
// PASSAGE_RELAY_ADDR, PASSAGE_SECRET, PASSAGE_TARGET.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the rendezvous HTTP service
    pub rendezvous_url: String,

    /// `host:port` of the relay TCP service
    pub relay_addr: String,

    /// Wrap relay connections in TLS
    pub relay_tls: bool,

    /// Shared MAC secret (servers only; peers never need it)
    pub secret: String,

    /// Default local target to bridge, `host:port` or a bare port
    pub target: String,

    /// Server settings used by `passage rendezvous` / `passage relay`
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port for the rendezvous HTTP listener
    pub rendezvous_port: u16,

    /// Port for the relay TCP listener
    pub relay_port: u16,

    /// Session TTL in seconds
    pub session_ttl_secs: u64,

    /// How long a parked relay connection waits for its peer, seconds
    pub pair_timeout_secs: u64,

    /// Hard ceiling on a spliced session, seconds
    pub max_session_secs: u64,

    /// TLS cert path for the relay (empty = plain TCP)
    pub tls_cert: String,

    /// TLS key path for the relay
    pub tls_key: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rendezvous_url: "http://localhost:8080".to_string(),
            relay_addr: "localhost:8443".to_string(),
            relay_tls: false,
            secret: passage_core::DEFAULT_SECRET.to_string(),
            target: "127.0.0.1:1626".to_string(),
            server: ServerConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            rendezvous_port: 8080,
            relay_port: 8443,
            session_ttl_secs: 15 * 60,
            pair_timeout_secs: 30,
            max_session_secs: 4 * 60 * 60,
            tls_cert: String::new(),
            tls_key: String::new(),
        }
    }
}

impl Config {
    /// Config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        Ok(dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("passage"))
    }

    /// Full path of the config file
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load the config file, falling back to defaults when absent, then
    /// apply environment overrides
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Write the config file, creating the directory if needed
    pub fn save(&self) -> Result<()> {
        let dir = Self::config_dir()?;
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let path = Self::config_path()?;
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&path, contents)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("PASSAGE_RENDEZVOUS_URL") {
            self.rendezvous_url = url;
        }
        if let Ok(addr) = std::env::var("PASSAGE_RELAY_ADDR") {
            self.relay_addr = addr;
        }
        if let Ok(secret) = std::env::var("PASSAGE_SECRET") {
            self.secret = secret;
        }
        if let Ok(target) = std::env::var("PASSAGE_TARGET") {
            self.target = target;
        }
    }
}
