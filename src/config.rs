use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::util::{env_optional, env_u64, env_usize, write_atomic};

pub(crate) const DEFAULT_CONFIG_FILE: &str = "panelvault.json";

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub(crate) struct FileConfig {
    #[serde(default)]
    pub(crate) index: IndexConfig,
    #[serde(default)]
    pub(crate) preview: PreviewConfig,
    #[serde(default)]
    pub(crate) snapshots: SnapshotConfig,
    #[serde(default)]
    pub(crate) manifest: ManifestConfig,
    #[serde(default)]
    pub(crate) sync: SyncConfig,
    #[serde(default)]
    pub(crate) server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub(crate) struct IndexConfig {
    #[serde(default = "default_busy_timeout_ms")]
    pub(crate) busy_timeout_ms: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub(crate) struct PreviewConfig {
    #[serde(default = "default_preview_max_bytes")]
    pub(crate) max_bytes: u64,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_preview_max_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub(crate) struct SnapshotConfig {
    #[serde(default = "default_snapshot_keep")]
    pub(crate) keep: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            keep: default_snapshot_keep(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub(crate) struct ManifestConfig {
    /// Keep at most this many `.bak` files after a save. Unlimited when unset.
    #[serde(default)]
    pub(crate) max_backups: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub(crate) struct SyncConfig {
    #[serde(default)]
    pub(crate) server_url: Option<String>,
    #[serde(default)]
    pub(crate) token: Option<String>,
    #[serde(default = "default_sync_timeout_ms")]
    pub(crate) timeout_ms: u64,
    #[serde(default = "default_pull_page_size")]
    pub(crate) pull_page_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            token: None,
            timeout_ms: default_sync_timeout_ms(),
            pull_page_size: default_pull_page_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub(crate) struct ServerConfig {
    #[serde(default = "default_bind")]
    pub(crate) bind: String,
    #[serde(default = "default_port")]
    pub(crate) port: u16,
    #[serde(default = "default_server_db")]
    pub(crate) db_path: PathBuf,
    #[serde(default)]
    pub(crate) admin_key: Option<String>,
    #[serde(default = "default_max_pull_limit")]
    pub(crate) max_pull_limit: usize,
    #[serde(default = "default_workers")]
    pub(crate) workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            db_path: default_server_db(),
            admin_key: None,
            max_pull_limit: default_max_pull_limit(),
            workers: default_workers(),
        }
    }
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_preview_max_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_snapshot_keep() -> usize {
    50
}

fn default_sync_timeout_ms() -> u64 {
    30_000
}

fn default_pull_page_size() -> usize {
    500
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8787
}

fn default_server_db() -> PathBuf {
    PathBuf::from("panelvault-server.sqlite")
}

fn default_max_pull_limit() -> usize {
    1_000
}

fn default_workers() -> usize {
    4
}

pub(crate) fn config_file_path(dir: &Path) -> PathBuf {
    dir.join(DEFAULT_CONFIG_FILE)
}

/// Missing or unreadable config falls back to defaults.
pub(crate) fn load_file_config(path: &Path) -> FileConfig {
    match std::fs::read_to_string(path) {
        Ok(data) => match serde_json::from_str(&data) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "ignoring unparsable config");
                FileConfig::default()
            }
        },
        Err(_) => FileConfig::default(),
    }
}

pub(crate) fn save_file_config(path: &Path, config: &FileConfig) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| crate::error::VaultError::io(parent, e))?;
    }
    let mut json = serde_json::to_string_pretty(config)?;
    json.push('\n');
    write_atomic(path, json.as_bytes())
}

impl FileConfig {
    /// Layer `PANELVAULT_*` environment variables over the file values.
    pub(crate) fn with_env_overrides(mut self) -> Result<Self> {
        if let Some(url) = env_optional("PANELVAULT_SERVER_URL") {
            self.sync.server_url = Some(url);
        }
        if let Some(token) = env_optional("PANELVAULT_TOKEN") {
            self.sync.token = Some(token);
        }
        if let Some(key) = env_optional("PANELVAULT_ADMIN_KEY") {
            self.server.admin_key = Some(key);
        }
        self.preview.max_bytes = env_u64("PANELVAULT_PREVIEW_MAX_BYTES", self.preview.max_bytes)?;
        self.snapshots.keep = env_usize("PANELVAULT_SNAPSHOT_KEEP", self.snapshots.keep)?;
        Ok(self)
    }
}
