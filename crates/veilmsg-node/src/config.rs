use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use veilmsg_network::{DaemonConfig, SamConfig};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub sam: SamConfig,
    pub daemon: DaemonConfig,
    pub queue: QueueConfig,
    pub messaging: MessagingConfig,
    pub logging: LoggingConfig,

    #[serde(skip)]
    config_file_path: PathBuf,
    #[serde(skip)]
    pub data_directory: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Scheduler tick
    pub poll_interval_secs: u64,
    /// Delay after the n-th failed attempt; the last entry repeats
    pub backoff_secs: Vec<u64>,
    pub max_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            backoff_secs: vec![30, 60, 120, 300, 600],
            max_attempts: 5,
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    /// Delay before the next attempt, given the failures recorded so far
    pub fn backoff(&self, retry_count: u32) -> Duration {
        if self.backoff_secs.is_empty() {
            return self.poll_interval();
        }
        let index = (retry_count as usize).min(self.backoff_secs.len() - 1);
        Duration::from_secs(self.backoff_secs[index])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Idle time after which a peer connection is rebuilt
    pub connection_staleness_secs: u64,
    /// Session key reuse window per contact; 0 uses a fresh key per message
    pub session_key_rotation_secs: u64,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            connection_staleness_secs: 300,
            session_key_rotation_secs: 0,
        }
    }
}

impl MessagingConfig {
    pub fn connection_staleness(&self) -> Duration {
        Duration::from_secs(self.connection_staleness_secs)
    }

    pub fn session_key_rotation(&self) -> Option<Duration> {
        match self.session_key_rotation_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            json: false,
        }
    }
}

impl Config {
    /// Defaults rooted at `data_dir`
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Config {
            sam: SamConfig::default(),
            daemon: DaemonConfig {
                data_dir: data_dir.join("i2p"),
                ..DaemonConfig::default()
            },
            queue: QueueConfig::default(),
            messaging: MessagingConfig::default(),
            logging: LoggingConfig {
                file: Some(data_dir.join("logs").join("veilmsg.log")),
                ..LoggingConfig::default()
            },
            config_file_path: Self::default_config_path(),
            data_directory: data_dir,
        }
    }

    /// Load configuration from file
    pub fn load(config_path: Option<PathBuf>, data_dir: Option<PathBuf>) -> Result<Self> {
        let config_path = config_path.unwrap_or_else(Self::default_config_path);
        let data_dir = data_dir.unwrap_or_else(Self::default_data_dir);

        if !config_path.exists() {
            anyhow::bail!(
                "Configuration file not found: {}\nRun `veilmsg init` to create a new configuration",
                config_path.display()
            );
        }

        let contents =
            fs::read_to_string(&config_path).context("Failed to read configuration file")?;

        let mut config: Config =
            serde_yaml::from_str(&contents).context("Failed to parse configuration file")?;

        if config.daemon.sam_port != config.sam.port {
            tracing::warn!(
                "daemon.sam_port ({}) differs from sam.port ({})",
                config.daemon.sam_port,
                config.sam.port
            );
        }

        config.config_file_path = config_path;
        config.data_directory = data_dir;

        Ok(config)
    }

    /// Create a new default configuration and write it out
    pub fn create_default(config_path: Option<PathBuf>, data_dir: Option<PathBuf>) -> Result<Self> {
        let config_path = config_path.unwrap_or_else(Self::default_config_path);
        let data_dir = data_dir.unwrap_or_else(Self::default_data_dir);

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::create_dir_all(&data_dir)?;

        let mut config = Self::with_data_dir(data_dir);
        config.config_file_path = config_path.clone();

        let yaml = serde_yaml::to_string(&config)?;
        fs::write(&config_path, yaml)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;

        Ok(config)
    }

    pub fn config_path(&self) -> &Path {
        &self.config_file_path
    }

    fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("veilmsg")
            .join("config.yaml")
    }

    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("veilmsg")
    }
}
