use std::env;
use std::fs;
use std::path::PathBuf;

const APP_DIR_NAME: &str = "simplefiles-uploader";

/// Returns the per-user directory holding config, token and history.
pub fn default_app_dir() -> PathBuf {
    let base = match env::consts::OS {
        "windows" => env::var_os("LOCALAPPDATA")
            .or_else(|| env::var_os("APPDATA"))
            .map(PathBuf::from),
        "macos" => env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join("Library").join("Application Support")),
        _ => env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .or_else(|| {
                env::var_os("HOME")
                    .map(PathBuf::from)
                    .map(|home| home.join(".local").join("share"))
            }),
    }
    .unwrap_or_else(|| PathBuf::from("."));

    base.join(APP_DIR_NAME)
}

/// Create the on-disk folder layout expected by the uploader.
pub fn ensure_base_dirs() -> std::io::Result<()> {
    fs::create_dir_all(default_app_dir())
}
