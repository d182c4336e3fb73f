//! Configuration file location
//!
//! Uses the directories crate for platform-appropriate locations:
//! - Linux: `~/.config/dap-harness/`
//! - macOS: `~/Library/Application Support/dap-harness/`
//! - Windows: `%APPDATA%\dap-harness\`

use std::path::PathBuf;

/// Application name used for config and data directories
const APP_NAME: &str = "dap-harness";

/// Get the configuration directory path
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the path to the configuration file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}
