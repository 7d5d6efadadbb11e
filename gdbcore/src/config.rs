/// Core configuration
///
/// Loaded from TOML; every field has a default so an empty file is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Debugger binary
    pub gdb_path: PathBuf,
    /// Arguments the debugger is started with
    pub gdb_args: Vec<String>,
    /// Root of the per-process IPC and index directories
    pub runtime_dir: PathBuf,
    /// Signal used by `interrupt_inferior` for pause requests
    pub interrupt_signal: String,
    pub prompt_timeout_ms: u64,
    pub companion_timeout_ms: u64,
    /// Bound of each async event bus queue
    pub event_queue_capacity: usize,
    /// Source an extension and exchange structured requests with it
    pub companion: bool,
    /// Extension sourced instead of the bundled one
    pub extension_script: Option<PathBuf>,
    /// Extra commands run after start-up
    pub init_commands: Vec<String>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            gdb_path: which::which("gdb").unwrap_or_else(|_| PathBuf::from("/bin/gdb")),
            gdb_args: vec!["--nx".to_string(), "--interpreter=mi".to_string()],
            runtime_dir: PathBuf::from("/dev/shm/tracehound"),
            interrupt_signal: "SIGINT".to_string(),
            prompt_timeout_ms: 5_000,
            companion_timeout_ms: 10_000,
            event_queue_capacity: 1024,
            companion: true,
            extension_script: None,
            init_commands: Vec::new(),
        }
    }
}

impl CoreConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn prompt_timeout(&self) -> Duration {
        Duration::from_millis(self.prompt_timeout_ms)
    }

    pub fn companion_timeout(&self) -> Duration {
        Duration::from_millis(self.companion_timeout_ms)
    }

    /// Directory for state tied to inferior `pid`
    pub fn process_dir(&self, pid: i32) -> PathBuf {
        self.runtime_dir.join(pid.to_string())
    }
}
