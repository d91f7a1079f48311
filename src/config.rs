//! Configuration for referral-store

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ReferralError;

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("referral-store")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the SQLite database
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Maximum pooled connections
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// How long a writer waits on a locked database before failing
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Length of generated handles
    #[serde(default = "default_handle_length")]
    pub handle_length: usize,

    /// Attempts before giving up on a free handle
    #[serde(default = "default_max_handle_attempts")]
    pub max_handle_attempts: u32,

    /// Handle credited when a submission arrives without one
    #[serde(default = "default_direct_handle")]
    pub direct_handle: String,

    /// Base URL used to build shareable referral links
    #[serde(default = "default_share_base_url")]
    pub share_base_url: String,

    /// Largest page size accepted by paginated queries
    #[serde(default = "default_max_page_size")]
    pub max_page_size: i64,

    /// Buffered events per subscriber before it starts lagging
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_pool_size() -> u32 {
    8
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_handle_length() -> usize {
    8
}

fn default_max_handle_attempts() -> u32 {
    20
}

fn default_direct_handle() -> String {
    "duplication".to_string()
}

fn default_share_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_max_page_size() -> i64 {
    100
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            pool_size: default_pool_size(),
            busy_timeout_ms: default_busy_timeout_ms(),
            handle_length: default_handle_length(),
            max_handle_attempts: default_max_handle_attempts(),
            direct_handle: default_direct_handle(),
            share_base_url: default_share_base_url(),
            max_page_size: default_max_page_size(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ReferralError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ReferralError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ReferralError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ReferralError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings the store cannot operate with
    pub fn validate(&self) -> Result<(), ReferralError> {
        if self.pool_size == 0 {
            return Err(ReferralError::Config("pool_size must be at least 1".into()));
        }
        if self.handle_length < 4 || self.handle_length > 64 {
            return Err(ReferralError::Config(
                "handle_length must be between 4 and 64".into(),
            ));
        }
        if self.max_handle_attempts == 0 {
            return Err(ReferralError::Config(
                "max_handle_attempts must be at least 1".into(),
            ));
        }
        crate::db::nodes::validate_handle(&self.direct_handle)
            .map_err(|e| ReferralError::Config(format!("direct_handle: {}", e)))?;
        if self.max_page_size < 1 {
            return Err(ReferralError::Config("max_page_size must be at least 1".into()));
        }
        Ok(())
    }

    /// Get database path
    pub fn database_path(&self) -> PathBuf {
        self.storage_dir.join("referrals.db")
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }

    /// Shareable link crediting `handle` on `page_id`
    pub fn referral_link(&self, page_id: &str, handle: &str) -> String {
        format!(
            "{}/p/{}?ref={}",
            self.share_base_url.trim_end_matches('/'),
            page_id,
            handle
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str("handle_length = 10\n").unwrap();
        assert_eq!(config.handle_length, 10);
        assert_eq!(config.max_handle_attempts, 20);
        assert_eq!(config.direct_handle, "duplication");
        config.validate().unwrap();
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.share_base_url = "https://example.org/".into();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.share_base_url, "https://example.org/");
        assert_eq!(
            loaded.referral_link("page-1", "alice"),
            "https://example.org/p/page-1?ref=alice"
        );
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let config = Config {
            max_handle_attempts: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ReferralError::Config(_))));
    }
}
