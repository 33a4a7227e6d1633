//! Daemon configuration.
//!
//! Stored as TOML at `$CHUNKVAULT_CONFIG` if set, otherwise:
//! - Linux: `~/.config/chunkvault/daemon.toml`
//! - Windows: `%APPDATA%/chunkvault/daemon.toml`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "CHUNKVAULT_CONFIG";

/// Daemon configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// WebSocket server port (0 = auto-assign).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Root for chunk data, session records and finished objects.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Seconds without activity before a transfer is failed and reclaimed.
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: u64,

    /// Seconds between stale-session sweeps.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// How many finished transfer ids to remember.
    #[serde(default = "default_retired_capacity")]
    pub retired_capacity: usize,

    /// Chunk size suggested to peers, in bytes.
    #[serde(default = "default_chunk_size_hint")]
    pub chunk_size_hint: u32,

    /// Maximum simultaneous peer connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_port() -> u16 {
    7380
}

fn default_storage_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let local = std::env::var("LOCALAPPDATA")
            .unwrap_or_else(|_| "C:\\Users\\Default\\AppData\\Local".into());
        PathBuf::from(local).join("chunkvault")
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home).join(".local").join("share").join("chunkvault")
    }
}

fn default_max_idle_secs() -> u64 {
    900
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_retired_capacity() -> usize {
    1024
}

fn default_chunk_size_hint() -> u32 {
    chunkvault_transfer::CoordinatorConfig::default().chunk_size_hint
}

fn default_max_connections() -> usize {
    64
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            storage_dir: default_storage_dir(),
            max_idle_secs: default_max_idle_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            retired_capacity: default_retired_capacity(),
            chunk_size_hint: default_chunk_size_hint(),
            max_connections: default_max_connections(),
        }
    }
}

impl Config {
    /// Loads configuration from disk, creating a default file if none exists.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&config_path())
    }

    /// Like [`load`](Self::load) with an explicit path.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Writes the configuration as TOML.
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.max_idle_secs > 0, "max_idle_secs must be positive");
        anyhow::ensure!(self.sweep_interval_secs > 0, "sweep_interval_secs must be positive");
        anyhow::ensure!(self.chunk_size_hint > 0, "chunk_size_hint must be positive");
        anyhow::ensure!(self.max_connections > 0, "max_connections must be positive");
        Ok(())
    }

    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Returns the configuration file path.
fn config_path() -> PathBuf {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return PathBuf::from(path);
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("chunkvault").join("daemon.toml")
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home)
            .join(".config")
            .join("chunkvault")
            .join("daemon.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.port, 7380);
        assert_eq!(config.max_idle_secs, 900);
        assert_eq!(config.sweep_interval_secs, 30);
        assert_eq!(config.retired_capacity, 1024);
        assert_eq!(config.chunk_size_hint, 4 * 1024 * 1024);
        assert!(config.storage_dir.ends_with("chunkvault"));
    }

    #[test]
    fn config_partial_toml() {
        let config: Config = toml::from_str("port = 9000\nmax_idle_secs = 60").unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.max_idle(), Duration::from_secs(60));
        assert_eq!(config.sweep_interval_secs, 30);
    }

    #[test]
    fn load_creates_default_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("daemon.toml");

        let created = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(Config::load_from(&path).unwrap(), created);
    }

    #[test]
    fn save_and_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("daemon.toml");
        let config = Config {
            port: 0,
            storage_dir: tmp.path().join("data"),
            retired_capacity: 8,
            ..Config::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn invalid_values_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("daemon.toml");
        std::fs::write(&path, "sweep_interval_secs = 0").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}
