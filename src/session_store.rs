//! Filesystem-backed session persistence
//!
//! One directory per instance under `<root>/session_data/`:
//!
//! ```text
//! session_data/
//!   instance_7/
//!     storage_state.json   // cookies + localStorage captured from the browser
//!     session_info.json    // {instance_id, proxy_ip, session_id, last_vote_time, vote_count}
//! ```
//!
//! Records are created at first successful login (outside this core),
//! updated after every successful vote, and never deleted here.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Stable identity of a persisted session folder. Never reused concurrently.
pub type InstanceId = u32;

const SESSION_DIR_PREFIX: &str = "instance_";
const STORAGE_STATE_FILE: &str = "storage_state.json";
const SESSION_INFO_FILE: &str = "session_info.json";

/// One browser cookie in driver-independent form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    /// Unix seconds; `None` for session cookies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<f64>,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
}

/// Browser state captured at the end of a successful attempt and restored
/// into the next launch for the same instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageState {
    #[serde(default)]
    pub cookies: Vec<StoredCookie>,
    /// Origin-scoped key/value pairs for the voting page
    #[serde(default)]
    pub local_storage: HashMap<String, String>,
}

/// Metadata sidecar for one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub instance_id: InstanceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_vote_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub vote_count: u64,
}

/// A complete persisted session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub info: SessionInfo,
    pub storage: StorageState,
}

/// Handle to the session directory tree
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    /// Open the store rooted at `<storage_root>/session_data`, creating the
    /// directory if needed.
    pub async fn open(storage_root: &Path) -> Result<Self> {
        let root = storage_root.join("session_data");
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("create session data dir {}", root.display()))?;
        Ok(Self { root })
    }

    fn instance_dir(&self, instance_id: InstanceId) -> PathBuf {
        self.root.join(format!("{SESSION_DIR_PREFIX}{instance_id}"))
    }

    /// Enumerate persisted instance ids, ascending.
    ///
    /// Folders that don't match the `instance_<id>` naming are skipped with
    /// a warning rather than failing the scan.
    pub async fn list(&self) -> Result<Vec<InstanceId>> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .with_context(|| format!("read {}", self.root.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(suffix) = name.strip_prefix(SESSION_DIR_PREFIX) else {
                continue;
            };
            match suffix.parse::<InstanceId>() {
                Ok(id) => ids.push(id),
                Err(_) => warn!(folder = name, "ignoring unparseable session folder"),
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    pub async fn exists(&self, instance_id: InstanceId) -> bool {
        tokio::fs::try_exists(self.instance_dir(instance_id).join(SESSION_INFO_FILE))
            .await
            .unwrap_or(false)
    }

    /// Load a complete record. A missing `storage_state.json` yields an
    /// empty storage state (fresh browser) rather than an error.
    pub async fn load(&self, instance_id: InstanceId) -> Result<SessionRecord> {
        let dir = self.instance_dir(instance_id);
        let info_raw = tokio::fs::read_to_string(dir.join(SESSION_INFO_FILE))
            .await
            .with_context(|| format!("read session info for instance {instance_id}"))?;
        let info: SessionInfo = serde_json::from_str(&info_raw)
            .with_context(|| format!("parse session info for instance {instance_id}"))?;

        let storage = match tokio::fs::read_to_string(dir.join(STORAGE_STATE_FILE)).await {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("parse storage state for instance {instance_id}"))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(instance_id, "no storage state on disk; starting fresh");
                StorageState::default()
            }
            Err(e) => return Err(e).context("read storage state"),
        };

        Ok(SessionRecord { info, storage })
    }

    /// Persist a complete record, creating the instance folder if needed.
    pub async fn save(&self, record: &SessionRecord) -> Result<()> {
        let dir = self.instance_dir(record.info.instance_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("create {}", dir.display()))?;

        let info_raw =
            serde_json::to_string_pretty(&record.info).context("serialize session info")?;
        tokio::fs::write(dir.join(SESSION_INFO_FILE), info_raw)
            .await
            .context("write session info")?;

        let storage_raw =
            serde_json::to_string_pretty(&record.storage).context("serialize storage state")?;
        tokio::fs::write(dir.join(STORAGE_STATE_FILE), storage_raw)
            .await
            .context("write storage state")?;

        debug!(
            instance_id = record.info.instance_id,
            votes = record.info.vote_count,
            "session record saved"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_record(id: InstanceId) -> SessionRecord {
        SessionRecord {
            info: SessionInfo {
                instance_id: id,
                proxy_ip: Some("1.1.1.1".to_string()),
                session_id: Some("tok-abc".to_string()),
                last_vote_time: Some(Utc::now()),
                vote_count: 12,
            },
            storage: StorageState {
                cookies: vec![StoredCookie {
                    name: "sid".to_string(),
                    value: "deadbeef".to_string(),
                    domain: ".example.com".to_string(),
                    path: "/".to_string(),
                    expires: Some(1_900_000_000.0),
                    http_only: true,
                    secure: true,
                }],
                local_storage: HashMap::from([("seen".to_string(), "1".to_string())]),
            },
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path()).await.unwrap();
        let record = sample_record(3);
        store.save(&record).await.unwrap();
        let loaded = store.load(3).await.unwrap();
        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn list_returns_sorted_ids_and_skips_noise() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path()).await.unwrap();
        for id in [5, 1, 9] {
            store.save(&sample_record(id)).await.unwrap();
        }
        // Noise folders that must not break the scan.
        tokio::fs::create_dir_all(dir.path().join("session_data/instance_bogus"))
            .await
            .unwrap();
        tokio::fs::create_dir_all(dir.path().join("session_data/leftover"))
            .await
            .unwrap();

        assert_eq!(store.list().await.unwrap(), vec![1, 5, 9]);
    }

    #[tokio::test]
    async fn exists_tracks_session_info_file() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path()).await.unwrap();
        assert!(!store.exists(1).await);
        store.save(&sample_record(1)).await.unwrap();
        assert!(store.exists(1).await);
    }

    #[tokio::test]
    async fn missing_storage_state_loads_as_fresh() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path()).await.unwrap();
        store.save(&sample_record(2)).await.unwrap();
        tokio::fs::remove_file(
            dir.path().join("session_data/instance_2/storage_state.json"),
        )
        .await
        .unwrap();
        let loaded = store.load(2).await.unwrap();
        assert_eq!(loaded.storage, StorageState::default());
    }
}
