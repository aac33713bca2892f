use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub modules: ModulesConfig,
    #[serde(default)]
    pub mounts: MountsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where modules are searched for
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModulesConfig {
    /// Directory scanned when the override variable is not set
    #[serde(default = "default_module_dir")]
    pub module_dir: PathBuf,

    /// Variable holding a path list of extra directories, scanned first
    #[serde(default = "default_extra_modules_env")]
    pub extra_modules_env: String,

    /// Variable replacing `module_dir`
    #[serde(default = "default_module_dir_env")]
    pub module_dir_env: String,
}

/// Mount table locations and monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountsConfig {
    /// Active mount table; detected when unset
    #[serde(default)]
    pub mtab_path: Option<PathBuf>,

    /// Static mount point table; detected when unset
    #[serde(default)]
    pub fstab_path: Option<PathBuf>,

    /// Poll interval when the mount table can't be watched
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_module_dir() -> PathBuf {
    PathBuf::from("/usr/lib/kiln/modules")
}

fn default_extra_modules_env() -> String {
    "KILN_EXTRA_MODULES".to_string()
}

fn default_module_dir_env() -> String {
    "KILN_MODULE_DIR".to_string()
}

fn default_poll_interval_ms() -> u64 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            module_dir: default_module_dir(),
            extra_modules_env: default_extra_modules_env(),
            module_dir_env: default_module_dir_env(),
        }
    }
}

impl Default for MountsConfig {
    fn default() -> Self {
        Self {
            mtab_path: None,
            fstab_path: None,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl MountsConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from default location
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file {}", path.as_ref().display()))?;

        let config: Config =
            serde_yaml::from_str(&contents).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = serde_yaml::to_string(self).context("Failed to serialize config")?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        fs::write(path.as_ref(), contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Get default configuration path
    pub fn default_config_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;

        Ok(home.join(".kiln").join("config.yaml"))
    }
}
