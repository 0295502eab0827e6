//! Configuration loading and persistence
//!
//! Resolution order on startup, highest priority first:
//! request-scoped override > `user_config.json` > environment variables >
//! compiled defaults. The persisted document is the single JSON file the
//! control plane reads and writes.

use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};

use crate::error::FatalError;

use super::types::{FleetConfig, StartOverrides, UserConfig};

/// Environment variable fallbacks for the persisted config fields
const ENV_VOTING_URL: &str = "VOTING_URL";
const ENV_PROXY_USERNAME: &str = "BRIGHT_DATA_USERNAME";
const ENV_PROXY_PASSWORD: &str = "BRIGHT_DATA_PASSWORD";

/// Handle to the persisted user configuration
///
/// Cheap to clone is not needed here: the store lives in the control-plane
/// state behind an `Arc`. Reads serve `GET /api/config`; writes serve
/// `POST /api/config` and persist before returning.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    cached: RwLock<UserConfig>,
}

impl ConfigStore {
    /// Open (or initialize empty) the user config at `<root>/user_config.json`
    ///
    /// A missing file is normal and yields an empty document. A present but
    /// unparseable file is fatal: silently discarding a user's config and
    /// voting against the wrong URL is worse than refusing to start.
    pub fn open(storage_root: &Path) -> Result<Self, FatalError> {
        let path = storage_root.join("user_config.json");
        let cached = match std::fs::read_to_string(&path) {
            Ok(raw) => {
                serde_json::from_str(&raw).map_err(|e| FatalError::ConfigParse {
                    path: path.clone(),
                    reason: e.to_string(),
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => UserConfig::default(),
            Err(e) => {
                return Err(FatalError::Storage {
                    path: path.clone(),
                    source: e,
                })
            }
        };
        Ok(Self {
            path,
            cached: RwLock::new(cached),
        })
    }

    /// Current persisted document
    #[must_use]
    pub fn current(&self) -> UserConfig {
        self.cached.read().clone()
    }

    /// Replace and persist the user config
    pub fn save(&self, config: UserConfig) -> Result<()> {
        let raw = serde_json::to_string_pretty(&config).context("serialize user config")?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create config directory {}", parent.display()))?;
        }
        std::fs::write(&self.path, raw)
            .with_context(|| format!("write {}", self.path.display()))?;
        *self.cached.write() = config;
        tracing::info!(path = %self.path.display(), "user config saved");
        Ok(())
    }

    /// Resolve the full runtime config for a new Supervisor run
    ///
    /// # Arguments
    /// * `overrides` - request-scoped values from `POST /api/start-monitoring`
    /// * `storage_root` - absolute root for session data and the vote log
    pub fn resolve(
        &self,
        overrides: &StartOverrides,
        storage_root: &Path,
    ) -> Result<FleetConfig, FatalError> {
        let file = self.current();
        let mut config = FleetConfig {
            storage_root: storage_root.to_path_buf(),
            ..FleetConfig::default()
        };

        config.voting_url = overrides
            .voting_url
            .clone()
            .or(file.voting_url)
            .or_else(|| std::env::var(ENV_VOTING_URL).ok())
            .ok_or(FatalError::MissingConfig("voting_url"))?;
        url::Url::parse(&config.voting_url).map_err(|e| FatalError::ConfigParse {
            path: self.path.clone(),
            reason: format!("voting_url is not a valid URL: {e}"),
        })?;

        config.proxy.username = overrides
            .username
            .clone()
            .or(file.bright_data_username)
            .or_else(|| std::env::var(ENV_PROXY_USERNAME).ok())
            .ok_or(FatalError::MissingConfig("bright_data_username"))?;
        config.proxy.password = overrides
            .password
            .clone()
            .or(file.bright_data_password)
            .or_else(|| std::env::var(ENV_PROXY_PASSWORD).ok())
            .ok_or(FatalError::MissingConfig("bright_data_password"))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_empty_config() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::open(dir.path()).unwrap();
        assert_eq!(store.current(), UserConfig::default());
    }

    #[test]
    fn save_then_reopen_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::open(dir.path()).unwrap();
        let config = UserConfig {
            voting_url: Some("https://vote.example.com/entry/9".to_string()),
            bright_data_username: Some("brd-customer-abc".to_string()),
            bright_data_password: Some("s3cret".to_string()),
        };
        store.save(config.clone()).unwrap();

        let reopened = ConfigStore::open(dir.path()).unwrap();
        assert_eq!(reopened.current(), config);
    }

    #[test]
    fn corrupt_file_is_fatal() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("user_config.json"), "{not json").unwrap();
        assert!(matches!(
            ConfigStore::open(dir.path()),
            Err(FatalError::ConfigParse { .. })
        ));
    }

    #[test]
    fn overrides_win_over_file() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::open(dir.path()).unwrap();
        store
            .save(UserConfig {
                voting_url: Some("https://file.example.com".to_string()),
                bright_data_username: Some("file-user".to_string()),
                bright_data_password: Some("file-pass".to_string()),
            })
            .unwrap();

        let overrides = StartOverrides {
            voting_url: Some("https://override.example.com".to_string()),
            username: None,
            password: None,
        };
        let resolved = store.resolve(&overrides, dir.path()).unwrap();
        assert_eq!(resolved.voting_url, "https://override.example.com");
        assert_eq!(resolved.proxy.username, "file-user");
    }
}
