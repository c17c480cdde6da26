use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// A file chosen by the user. Immutable for the lifetime of its task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectedFile {
    pub name: String,
    pub path: PathBuf,
}

impl SelectedFile {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    pub fn from_path(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self::new(name, path)
    }
}

#[derive(Clone, Debug, Deserialize)]
struct StoreResponse {
    file: StoredFile,
}

#[derive(Clone, Debug, Deserialize)]
struct StoredFile {
    id: serde_json::Value,
}

/// Extract the resource identifier from a `{"file": {"id": ...}}` body.
///
/// String and numeric ids are accepted; anything else is malformed.
pub fn parse_resource_id(body: &str) -> Result<String, String> {
    let response: StoreResponse =
        serde_json::from_str(body).map_err(|e| format!("invalid store response: {e}"))?;
    match response.file.id {
        serde_json::Value::String(id) if !id.is_empty() => Ok(id),
        serde_json::Value::Number(id) => Ok(id.to_string()),
        other => Err(format!("unexpected file id: {other}")),
    }
}

/// A successful upload remembered across sessions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRecord {
    pub file_name: String,
    pub resource_id: String,
    pub page_url: String,
    pub uploaded_at: String,
}
