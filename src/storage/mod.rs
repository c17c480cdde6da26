use std::fs;
use std::path::{Path, PathBuf};

use log::warn;

use crate::config::UploaderConfig;
use crate::credentials::TokenFile;
use crate::engine::models::UploadRecord;
use crate::env;

const CONFIG_FILE: &str = "config.json";
const TOKEN_FILE: &str = "token";
const HISTORY_FILE: &str = "history.json";
const HISTORY_LIMIT: usize = 200;

#[derive(Clone)]
pub struct StorageManager {
    base_dir: PathBuf,
}

impl StorageManager {
    pub fn new() -> Self {
        // Best-effort directory creation; failures are surfaced on write.
        let _ = env::ensure_base_dirs();
        Self::with_base_dir(env::default_app_dir())
    }

    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn token_path(&self) -> PathBuf {
        self.base_dir.join(TOKEN_FILE)
    }

    /// Credential source backed by the shared token file.
    pub fn token_source(&self) -> TokenFile {
        TokenFile::new(self.token_path())
    }

    pub fn load_config(&self) -> UploaderConfig {
        let path = self.base_dir.join(CONFIG_FILE);
        let Ok(bytes) = fs::read(&path) else {
            return UploaderConfig::default();
        };
        serde_json::from_slice(&bytes).unwrap_or_else(|err| {
            warn!(
                "storage: ignoring unreadable config {} ({err})",
                path.display()
            );
            UploaderConfig::default()
        })
    }

    pub fn save_config(&self, config: &UploaderConfig) -> Result<(), String> {
        let json = serde_json::to_vec_pretty(config)
            .map_err(|e| format!("unable to encode config: {e}"))?;
        self.write(CONFIG_FILE, &json)
    }

    pub fn write_token(&self, token: &str) -> Result<(), String> {
        self.write(TOKEN_FILE, token.trim().as_bytes())
    }

    pub fn read_history(&self) -> Vec<UploadRecord> {
        let path = self.base_dir.join(HISTORY_FILE);
        fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default()
    }

    /// Prepend a record, keeping the most recent entries only.
    pub fn append_history(&self, record: UploadRecord) -> Result<Vec<UploadRecord>, String> {
        let mut history = self.read_history();
        history.insert(0, record);
        history.truncate(HISTORY_LIMIT);
        let json = serde_json::to_vec_pretty(&history)
            .map_err(|e| format!("unable to encode history: {e}"))?;
        self.write(HISTORY_FILE, &json)?;
        Ok(history)
    }

    fn write(&self, name: &str, contents: &[u8]) -> Result<(), String> {
        fs::create_dir_all(&self.base_dir)
            .map_err(|e| format!("unable to create {}: {e}", self.base_dir.display()))?;
        let path = self.base_dir.join(name);
        fs::write(&path, contents).map_err(|e| format!("unable to write {}: {e}", path.display()))
    }
}
