//! CLI configuration management.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/bucketlift/config.toml`
//! - Windows: `%APPDATA%/bucketlift/config.toml`
//!
//! The resume store lives next to it by default.

use std::path::{Path, PathBuf};

use bucketlift_engine::EngineConfig;
use serde::{Deserialize, Serialize};

/// CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// JSON file holding resume records of unfinished multipart uploads.
    #[serde(default = "default_resume_store")]
    pub resume_store: PathBuf,

    #[serde(default)]
    pub signing: SigningConfig,

    #[serde(default)]
    pub engine: EngineConfig,
}

/// Where the signing service lives and how to authenticate with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default)]
    pub access_token: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

fn default_base_url() -> String {
    "http://localhost:8080/api".into()
}

fn default_resume_store() -> PathBuf {
    config_dir().join("resume.json")
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            access_token: String::new(),
            refresh_token: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            resume_store: default_resume_store(),
            signing: SigningConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from `path` (or the default location), creating a
    /// default file if none exists. Returns the path that was used.
    pub fn load(path: Option<&Path>) -> anyhow::Result<(Self, PathBuf)> {
        let path = path.map_or_else(config_path, Path::to_path_buf);

        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let config: Config = toml::from_str(&content)?;
            Ok((config, path))
        } else {
            let config = Config::default();
            config.save(&path)?;
            tracing::info!(path = %path.display(), "created default configuration");
            Ok((config, path))
        }
    }

    /// Saves the configuration to `path`.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        // Tokens live in here.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }
}

fn config_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("bucketlift")
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home).join(".config").join("bucketlift")
    }
}

/// Returns the platform-specific configuration file path.
fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}
