//! Configuration system for talus.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $TALUS_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/talus/config.toml
//!   3. ~/.config/talus/config.toml

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TalusConfig {
    pub network: NetworkConfig,
    pub sessions: SessionConfig,
    pub status: StatusConfig,
    pub psk: PskConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// UDP port for DTLS traffic. 5684 is the registered CoAPS port.
    pub port: u16,
    /// Outbound MTU budget in bytes.
    pub mtu: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Inactivity limit for sessions without a connection ID, in seconds.
    pub timeout_secs: u64,
    /// Inactivity limit for sessions with a connection ID, in seconds.
    pub timeout_with_cid_secs: u64,
    /// Cap on concurrently handshaking sessions.
    pub max_handshakes: usize,
    /// How often the idle reaper scans, in seconds.
    pub reaper_interval_secs: u64,
    /// How long unbind waits for queued sends to flush, in seconds.
    pub drain_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    /// Serve the JSON status endpoint on localhost.
    pub enabled: bool,
    /// TCP port for the status endpoint.
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PskConfig {
    /// PSK identity → key, consumed by the development provider.
    pub identities: HashMap<String, String>,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for TalusConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            sessions: SessionConfig::default(),
            status: StatusConfig::default(),
            psk: PskConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: 5684,
            mtu: 1500,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 3600,
            timeout_with_cid_secs: 3600,
            max_handshakes: 1000,
            reaper_interval_secs: 10,
            drain_timeout_secs: 5,
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 5690,
        }
    }
}

impl Default for PskConfig {
    fn default() -> Self {
        Self {
            identities: HashMap::new(),
        }
    }
}

impl SessionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn timeout_with_cid(&self) -> Duration {
        Duration::from_secs(self.timeout_with_cid_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("talus")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl TalusConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            TalusConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("TALUS_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&TalusConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply TALUS_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TALUS_NETWORK__PORT") {
            if let Ok(p) = v.parse() {
                self.network.port = p;
            }
        }
        if let Ok(v) = std::env::var("TALUS_NETWORK__MTU") {
            if let Ok(m) = v.parse() {
                self.network.mtu = m;
            }
        }
        if let Ok(v) = std::env::var("TALUS_SESSIONS__TIMEOUT_SECS") {
            if let Ok(t) = v.parse() {
                self.sessions.timeout_secs = t;
            }
        }
        if let Ok(v) = std::env::var("TALUS_SESSIONS__TIMEOUT_WITH_CID_SECS") {
            if let Ok(t) = v.parse() {
                self.sessions.timeout_with_cid_secs = t;
            }
        }
        if let Ok(v) = std::env::var("TALUS_SESSIONS__MAX_HANDSHAKES") {
            if let Ok(n) = v.parse() {
                self.sessions.max_handshakes = n;
            }
        }
        if let Ok(v) = std::env::var("TALUS_STATUS__ENABLED") {
            self.status.enabled = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("TALUS_STATUS__PORT") {
            if let Ok(p) = v.parse() {
                self.status.port = p;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_registered_ports() {
        let config = TalusConfig::default();
        assert_eq!(config.network.port, 5684);
        assert_eq!(config.network.mtu, 1500);
        assert_eq!(config.sessions.max_handshakes, 1000);
        assert_eq!(config.sessions.timeout(), Duration::from_secs(3600));
        assert_eq!(config.sessions.timeout_with_cid(), Duration::from_secs(3600));
    }

    #[test]
    fn psk_identities_parse_from_toml() {
        let config: TalusConfig = toml::from_str(
            r#"
            [network]
            port = 15684

            [psk.identities]
            user = "password"
            "#,
        )
        .unwrap();
        assert_eq!(config.network.port, 15684);
        assert_eq!(config.psk.identities["user"], "password");
        // Unspecified sections fall back to defaults.
        assert_eq!(config.sessions.max_handshakes, 1000);
    }

    #[test]
    fn write_default_if_missing_creates_file() {
        let tmp = std::env::temp_dir().join(format!("talus-config-test-{}", std::process::id()));
        let config_path = tmp.join("config.toml");
        std::fs::create_dir_all(&tmp).unwrap();

        unsafe {
            std::env::set_var("TALUS_CONFIG", config_path.to_str().unwrap());
        }

        let path = TalusConfig::write_default_if_missing().expect("write_default_if_missing failed");
        assert!(path.exists());

        let config = TalusConfig::load().expect("load should succeed");
        assert_eq!(config.network.port, 5684);
        assert!(config.psk.identities.is_empty());

        unsafe {
            std::env::remove_var("TALUS_CONFIG");
        }
        let _ = std::fs::remove_dir_all(&tmp);
    }
}
