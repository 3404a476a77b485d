use crate::error::BgxError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BgxConfig {
    #[serde(default = "default_ota_chunk_size")]
    pub ota_chunk_size: usize, // bytes, non-zero multiple of 4
    #[serde(default = "default_write_chunk_size")]
    pub default_write_chunk_size: usize, // used until the MTU is negotiated
    #[serde(default = "default_requested_mtu")]
    pub requested_mtu: u16,
    #[serde(default = "default_connect_retry_limit")]
    pub connect_retry_limit: u32,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    #[serde(default = "default_ota_finish_settle_ms")]
    pub ota_finish_settle_ms: u64, // peripheral reboots after install
    #[serde(default = "default_scan_duration_secs")]
    pub scan_duration_secs: u64,

    // Firmware catalog (DMS)
    #[serde(default = "default_dms_base_url")]
    pub dms_base_url: String,
    #[serde(default)]
    pub dms_api_key: Option<String>,
    #[serde(default)]
    pub firmware_cache_dir: Option<PathBuf>,

    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_ota_chunk_size() -> usize {
    244
}
fn default_write_chunk_size() -> usize {
    20
}
fn default_requested_mtu() -> u16 {
    247
}
fn default_connect_retry_limit() -> u32 {
    3
}
fn default_connect_timeout_ms() -> u64 {
    15_000
}
fn default_operation_timeout_ms() -> u64 {
    10_000
}
fn default_ota_finish_settle_ms() -> u64 {
    15_000
}
fn default_scan_duration_secs() -> u64 {
    10
}
fn default_dms_base_url() -> String {
    "https://xpress-api.zentri.com".to_string()
}

impl Default for BgxConfig {
    fn default() -> Self {
        Self {
            ota_chunk_size: default_ota_chunk_size(),
            default_write_chunk_size: default_write_chunk_size(),
            requested_mtu: default_requested_mtu(),
            connect_retry_limit: default_connect_retry_limit(),
            connect_timeout_ms: default_connect_timeout_ms(),
            operation_timeout_ms: default_operation_timeout_ms(),
            ota_finish_settle_ms: default_ota_finish_settle_ms(),
            scan_duration_secs: default_scan_duration_secs(),
            dms_base_url: default_dms_base_url(),
            dms_api_key: None,
            firmware_cache_dir: None,
            log_dir: None,
        }
    }
}

impl BgxConfig {
    /// Default config location: `<config dir>/bgx-commander/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("bgx-commander").join("config.toml"))
    }

    pub fn load(path: &Path) -> Result<Self, BgxError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BgxError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let config: BgxConfig = toml::from_str(&content)
            .map_err(|e| BgxError::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the default location, falling back to defaults when no
    /// file exists there.
    pub fn load_default() -> Result<Self, BgxError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), BgxError> {
        if self.ota_chunk_size == 0 || self.ota_chunk_size % 4 != 0 {
            return Err(BgxError::Config(format!(
                "ota_chunk_size must be a non-zero multiple of 4, got {}",
                self.ota_chunk_size
            )));
        }
        if self.default_write_chunk_size == 0 {
            return Err(BgxError::Config("default_write_chunk_size must be non-zero".into()));
        }
        if self.requested_mtu < 23 {
            return Err(BgxError::Config(format!(
                "requested_mtu must be at least 23, got {}",
                self.requested_mtu
            )));
        }
        if self.connect_retry_limit == 0 {
            return Err(BgxError::Config("connect_retry_limit must be at least 1".into()));
        }
        Ok(())
    }

    pub fn firmware_cache_dir(&self) -> PathBuf {
        self.firmware_cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("bgx-commander")
                .join("firmware")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: BgxConfig = toml::from_str("").unwrap();
        assert_eq!(config, BgxConfig::default());
        assert_eq!(config.ota_chunk_size, 244);
        assert_eq!(config.requested_mtu, 247);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_override() {
        let config: BgxConfig = toml::from_str(
            "ota_chunk_size = 128\ndms_api_key = \"abc\"\nconnect_retry_limit = 5\n",
        )
        .unwrap();
        assert_eq!(config.ota_chunk_size, 128);
        assert_eq!(config.dms_api_key.as_deref(), Some("abc"));
        assert_eq!(config.connect_retry_limit, 5);
        assert_eq!(config.operation_timeout_ms, 10_000);
    }

    #[test]
    fn test_chunk_size_must_be_word_aligned() {
        let config = BgxConfig {
            ota_chunk_size: 243,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(BgxError::Config(_))));
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        let path = std::env::temp_dir().join("bgx-no-such-config.toml");
        assert!(matches!(BgxConfig::load(&path), Err(BgxError::Config(_))));
    }
}
