//! Configuration file handling

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::paths::config_path;
use super::{Error, Result};

/// Handshake line printed by adapters that listen on a TCP port
pub const DEFAULT_HANDSHAKE: &str = r"^Listening on port (\d+)\s";

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Debug adapter settings
    #[serde(default)]
    pub adapter: AdapterConfig,

    /// Timeout settings
    #[serde(default)]
    pub timeouts: Timeouts,

    /// Variable tree settings
    #[serde(default)]
    pub inspector: InspectorConfig,
}

/// How to start the debug adapter
///
/// The argument shape differs between adapter builds, so it is kept
/// entirely in configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AdapterConfig {
    /// Path or bare name of the adapter executable
    #[serde(default = "default_adapter")]
    pub path: PathBuf,

    /// Arguments to pass to the adapter
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment; values may contain `${env:NAME}`
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Regex matched against the adapter's combined output; group 1 is the port
    #[serde(default = "default_handshake")]
    pub handshake: String,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            path: default_adapter(),
            args: Vec::new(),
            env: HashMap::new(),
            handshake: default_handshake(),
        }
    }
}

fn default_adapter() -> PathBuf {
    PathBuf::from("codelldb")
}

fn default_handshake() -> String {
    DEFAULT_HANDSHAKE.to_string()
}

/// Timeout settings in milliseconds
#[derive(Debug, Clone, Deserialize)]
pub struct Timeouts {
    /// Deadline for the adapter's handshake line
    #[serde(default = "default_handshake_ms")]
    pub handshake_ms: u64,

    /// Deadline for connecting to the announced port
    #[serde(default = "default_connect_ms")]
    pub connect_ms: u64,

    /// Deadline for the 'initialized' event
    #[serde(default = "default_initialize_ms")]
    pub initialize_ms: u64,

    /// Deadline for ordinary requests
    #[serde(default = "default_request_ms")]
    pub request_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            handshake_ms: default_handshake_ms(),
            connect_ms: default_connect_ms(),
            initialize_ms: default_initialize_ms(),
            request_ms: default_request_ms(),
        }
    }
}

impl Timeouts {
    pub fn handshake(&self) -> Duration {
        Duration::from_millis(self.handshake_ms)
    }

    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn initialize(&self) -> Duration {
        Duration::from_millis(self.initialize_ms)
    }

    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }
}

fn default_handshake_ms() -> u64 {
    5_000
}
fn default_connect_ms() -> u64 {
    2_000
}
fn default_initialize_ms() -> u64 {
    10_000
}
fn default_request_ms() -> u64 {
    30_000
}

/// Variable tree settings
#[derive(Debug, Clone, Deserialize)]
pub struct InspectorConfig {
    /// Deepest path a tree comparison will descend
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

impl Default for InspectorConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
        }
    }
}

fn default_max_depth() -> usize {
    32
}

impl Config {
    /// Load configuration from the default config file
    ///
    /// Returns default configuration if file doesn't exist
    pub fn load() -> Result<Self> {
        match config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|e| Error::ConfigParse(e.to_string()))
    }
}

impl AdapterConfig {
    /// Resolve the adapter executable
    ///
    /// Explicit paths are used as-is; bare names are looked up in PATH.
    pub fn resolve_path(&self) -> Result<PathBuf> {
        if self.path.components().count() > 1 || self.path.is_absolute() {
            return Ok(self.path.clone());
        }
        which::which(&self.path).map_err(|e| {
            Error::spawn(
                self.path.display(),
                format!("not found in PATH ({})", e),
            )
        })
    }

    /// Compile the handshake pattern in multi-line mode
    pub fn handshake_regex(&self) -> Result<regex::Regex> {
        regex::RegexBuilder::new(&self.handshake)
            .multi_line(true)
            .build()
            .map_err(|e| Error::Config(format!("Invalid handshake pattern: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_sections_missing() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.adapter.handshake, DEFAULT_HANDSHAKE);
        assert_eq!(config.timeouts.request_ms, 30_000);
        assert_eq!(config.inspector.max_depth, 32);
    }

    #[test]
    fn test_adapter_section() {
        let config: Config = toml::from_str(
            r#"
[adapter]
path = "/opt/adapter/bin/codelldb"
args = ["--port", "0"]
env = { LLDB_DEBUGSERVER_PATH = "${env:HOME}/bin/debugserver" }

[timeouts]
handshake_ms = 1500
"#,
        )
        .unwrap();

        assert_eq!(config.adapter.args, vec!["--port", "0"]);
        assert_eq!(
            config.adapter.env["LLDB_DEBUGSERVER_PATH"],
            "${env:HOME}/bin/debugserver"
        );
        assert_eq!(config.timeouts.handshake(), Duration::from_millis(1500));
        assert_eq!(config.timeouts.connect_ms, 2_000);
        assert_eq!(
            config.adapter.resolve_path().unwrap(),
            PathBuf::from("/opt/adapter/bin/codelldb")
        );
    }

    #[test]
    fn test_handshake_regex_is_multiline() {
        let adapter = AdapterConfig::default();
        let re = adapter.handshake_regex().unwrap();
        let caps = re.captures("warming up\nListening on port 4711\n").unwrap();
        assert_eq!(&caps[1], "4711");
    }

    #[test]
    fn test_missing_adapter_is_spawn_error() {
        let adapter = AdapterConfig {
            path: PathBuf::from("definitely-not-a-real-adapter-binary"),
            ..Default::default()
        };
        assert!(matches!(adapter.resolve_path(), Err(Error::Spawn { .. })));
    }
}
