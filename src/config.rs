use serde::{Deserialize, Serialize};

pub const DEFAULT_SERVER_URL: &str = "http://localhost:8080";
const STORE_PATH: &str = "/api/store";
const FILE_PAGE_PATH: &str = "/file.html#";

/// Settings persisted in `config.json`. Missing fields take their defaults.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploaderConfig {
    pub server_url: String,
    pub show_throughput: bool,
    pub allow_cancel: bool,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_owned(),
            show_throughput: true,
            allow_cancel: true,
        }
    }
}

impl UploaderConfig {
    fn base_url(&self) -> &str {
        self.server_url.trim().trim_end_matches('/')
    }

    /// Where files are POSTed.
    pub fn store_endpoint(&self) -> String {
        format!("{}{STORE_PATH}", self.base_url())
    }

    /// Browser page showing a stored file.
    pub fn file_page_url(&self, resource_id: &str) -> String {
        format!("{}{FILE_PAGE_PATH}{resource_id}", self.base_url())
    }
}
