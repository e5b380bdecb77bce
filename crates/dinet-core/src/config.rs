//! Configuration system for dinet.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $DINET_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/dinet/config.toml
//!   3. ~/.config/dinet/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::module::{ModuleIdentity, ModuleType};
use crate::reg::{RegWidth, DEFAULT_BACKEND_BOUNDARY};
use crate::wire::DiAddr;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DinetConfig {
    pub link: LinkConfig,
    pub host: HostConfig,
    pub target: TargetConfig,
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Longest packet a link carries, header included, in words.
    pub max_packet_len: usize,
    /// Depth of each module's input buffer in words.
    pub buffer_depth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// The host's own module address.
    pub address: DiAddr,
    pub register_timeout_ms: u64,
    /// Reassembled events kept for `event_receive` before new ones are dropped.
    pub event_queue_depth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// First register address served by a module's backend.
    pub backend_boundary: u16,
    pub max_reg_width: RegWidth,
    pub system_vendor_id: u16,
    pub system_device_id: u16,
    /// Pause between simulation bursts. 0 = yield only.
    pub step_interval_us: u64,
    /// Modules after the subnet control module, at addresses 1, 2, ...
    pub modules: Vec<ModuleSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleSpec {
    #[serde(flatten)]
    pub identity: ModuleIdentity,
    #[serde(default)]
    pub can_stall: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Daemon bind address.
    pub listen: String,
    /// Address the host tools connect to.
    pub target: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            max_packet_len: 12,
            buffer_depth: 16,
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            address: DiAddr::from_word(DiAddr::MAX),
            register_timeout_ms: 1000,
            event_queue_depth: 256,
        }
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            backend_boundary: DEFAULT_BACKEND_BOUNDARY,
            max_reg_width: RegWidth::W128,
            system_vendor_id: 1,
            system_device_id: 1,
            step_interval_us: 0,
            modules: vec![
                ModuleSpec {
                    identity: ModuleIdentity::osd(ModuleType::Mam, 0),
                    can_stall: false,
                },
                ModuleSpec {
                    identity: ModuleIdentity::osd(ModuleType::Stm, 0),
                    can_stall: true,
                },
            ],
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7411".to_string(),
            target: "127.0.0.1:7411".to_string(),
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("dinet")
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
    #[error("invalid value for {0}: {1}")]
    InvalidOverride(&'static str, String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl DinetConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            DinetConfig::default()
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("DINET_CONFIG")
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
            let text = toml::to_string_pretty(&DinetConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply DINET_* env var overrides.
    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup. Unparseable numbers are errors.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("DINET_LINK__MAX_PACKET_LEN") {
            self.link.max_packet_len = parse_num("DINET_LINK__MAX_PACKET_LEN", &v)?;
        }
        if let Some(v) = lookup("DINET_HOST__ADDRESS") {
            let raw: u16 = parse_num("DINET_HOST__ADDRESS", &v)?;
            self.host.address = DiAddr::new(raw)
                .map_err(|e| ConfigError::InvalidOverride("DINET_HOST__ADDRESS", e.to_string()))?;
        }
        if let Some(v) = lookup("DINET_HOST__REGISTER_TIMEOUT_MS") {
            self.host.register_timeout_ms = parse_num("DINET_HOST__REGISTER_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("DINET_NETWORK__LISTEN") {
            self.network.listen = v;
        }
        if let Some(v) = lookup("DINET_NETWORK__TARGET") {
            self.network.target = v;
        }
        Ok(())
    }
}

/// Decimal, or hex with a `0x` prefix.
fn parse_num<T>(key: &'static str, text: &str) -> Result<T, ConfigError>
where
    T: TryFrom<u64>,
{
    let text = text.trim();
    let parsed = match text.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse::<u64>(),
    };
    parsed
        .ok()
        .and_then(|n| T::try_from(n).ok())
        .ok_or_else(|| ConfigError::InvalidOverride(key, text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = DinetConfig::default();
        assert_eq!(config.link.max_packet_len, 12);
        assert_eq!(config.host.address.raw(), 0x3ff);
        assert_eq!(config.host.register_timeout_ms, 1000);
        assert_eq!(config.target.backend_boundary, 0x200);
        assert_eq!(config.target.max_reg_width, RegWidth::W128);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let text = r#"
            [link]
            max_packet_len = 20

            [target]
            max_reg_width = 32

            [[target.modules]]
            vendor = 1
            type = 4
            version = 2
            can_stall = true
        "#;
        let config = DinetConfig::from_toml(text).unwrap();
        assert_eq!(config.link.max_packet_len, 20);
        assert_eq!(config.link.buffer_depth, 16);
        assert_eq!(config.target.max_reg_width, RegWidth::W32);
        assert_eq!(config.target.modules.len(), 1);
        assert_eq!(config.target.modules[0].identity.module_type, ModuleType::Stm);
        assert!(config.target.modules[0].can_stall);
        assert_eq!(config.host.event_queue_depth, 256);
    }

    #[test]
    fn bad_width_is_a_parse_error() {
        assert!(DinetConfig::from_toml("[target]\nmax_reg_width = 48\n").is_err());
        assert!(DinetConfig::from_toml("[host]\naddress = 1024\n").is_err());
    }

    #[test]
    fn overrides_apply_from_lookup() {
        let env: HashMap<&str, &str> = [
            ("DINET_HOST__ADDRESS", "0x3fe"),
            ("DINET_LINK__MAX_PACKET_LEN", "16"),
            ("DINET_NETWORK__TARGET", "10.0.0.2:7411"),
        ]
        .into_iter()
        .collect();
        let mut config = DinetConfig::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.host.address.raw(), 0x3fe);
        assert_eq!(config.link.max_packet_len, 16);
        assert_eq!(config.network.target, "10.0.0.2:7411");
    }

    #[test]
    fn unparseable_override_is_rejected() {
        let mut config = DinetConfig::default();
        let err = config
            .apply_overrides(|k| (k == "DINET_HOST__ADDRESS").then(|| "0x400".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOverride("DINET_HOST__ADDRESS", _)));

        let err = config
            .apply_overrides(|k| (k == "DINET_HOST__REGISTER_TIMEOUT_MS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOverride(..)));
    }

    #[test]
    fn write_default_if_missing_creates_file() {
        let tmp = std::env::temp_dir().join(format!("dinet-config-test-{}", std::process::id()));
        let config_path = tmp.join("config.toml");
        std::fs::create_dir_all(&tmp).unwrap();

        unsafe {
            std::env::set_var("DINET_CONFIG", config_path.to_str().unwrap());
        }

        let path = DinetConfig::write_default_if_missing().expect("write_default_if_missing failed");
        assert!(path.exists());

        let config = DinetConfig::load().expect("load should succeed");
        assert_eq!(config.link.max_packet_len, 12);
        assert_eq!(config.target.modules.len(), 2);

        unsafe {
            std::env::remove_var("DINET_CONFIG");
        }
        let _ = std::fs::remove_dir_all(&tmp);
    }
}
