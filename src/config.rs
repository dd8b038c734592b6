use anyhow::Result;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::preparser::DEFAULT_WORKERS;

/// Main configuration structure that can be loaded from CLI or config file
///
/// Example configuration file content
/// # Thumbnail Service Configuration
///
/// # Server configuration
/// listen_on_port = 32840
/// workspace = "./data"
///
/// # Engine configuration
/// timeout_secs = 3
/// engine_workers = 0   # 0 = size from CPU count
///
/// # Output configuration
/// jpeg_quality = 80
#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[command(version, about, long_about = None)]
#[serde(default)]
pub struct Config {
    /// Port to listen on
    #[arg(short, long, default_value_t = 32840)]
    #[serde(default = "default_port")]
    pub listen_on_port: u16,

    /// Working directory for media inputs and generated thumbnails
    #[arg(short = 'w', long, default_value = ".")]
    #[serde(default = "default_workspace")]
    pub workspace: String,

    /// Per-request preparse timeout in seconds
    #[arg(short, long, default_value_t = 3)]
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Preparser worker threads (0 = size from CPU count)
    #[arg(long, default_value_t = 0)]
    #[serde(default)]
    pub engine_workers: usize,

    /// JPEG quality for exported thumbnails (1-100)
    #[arg(short = 'q', long, default_value_t = 80)]
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,

    /// Configuration file path (overrides all other arguments)
    #[arg(short, long)]
    #[serde(skip)]
    pub config: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_on_port: default_port(),
            workspace: default_workspace(),
            timeout_secs: default_timeout_secs(),
            engine_workers: 0,
            jpeg_quality: default_jpeg_quality(),
            config: None,
        }
    }
}

impl Config {
    /// Load configuration from CLI args, optionally merging with a config file
    pub fn load() -> Result<Self> {
        // First parse CLI args
        let mut config = Config::parse();

        // If a config file is specified, load it and merge
        if let Some(config_path) = &config.config {
            let file_config = Self::from_file(Path::new(config_path))?;
            config = config.merge_with_file(file_config);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Merge with file config, CLI args take precedence
    fn merge_with_file(mut self, file_config: Config) -> Self {
        // If CLI value is default, use file value
        if self.listen_on_port == default_port() {
            self.listen_on_port = file_config.listen_on_port;
        }
        if self.workspace == default_workspace() {
            self.workspace = file_config.workspace;
        }
        if self.timeout_secs == default_timeout_secs() {
            self.timeout_secs = file_config.timeout_secs;
        }
        if self.engine_workers == 0 {
            self.engine_workers = file_config.engine_workers;
        }
        if self.jpeg_quality == default_jpeg_quality() {
            self.jpeg_quality = file_config.jpeg_quality;
        }

        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.workspace.is_empty() {
            return Err(anyhow::anyhow!("Workspace directory cannot be empty"));
        }
        if self.timeout_secs == 0 {
            return Err(anyhow::anyhow!("Engine timeout must be at least 1 second"));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(anyhow::anyhow!(
                "JPEG quality must be in 1-100, got {}",
                self.jpeg_quality
            ));
        }

        Ok(())
    }

    pub fn engine_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Worker count with the 0 = auto convention resolved.
    pub fn effective_engine_workers(&self) -> usize {
        if self.engine_workers == 0 {
            *DEFAULT_WORKERS
        } else {
            self.engine_workers
        }
    }
}

// Default value functions
fn default_port() -> u16 {
    32840
}

fn default_workspace() -> String {
    ".".to_string()
}

fn default_timeout_secs() -> u64 {
    3
}

fn default_jpeg_quality() -> u8 {
    80
}
