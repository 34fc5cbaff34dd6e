use anyhow::{anyhow, Result};
use directories::{ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::plan::RetryLimit;

const QUALIFIER: &str = "com";
const ORGANIZATION: &str = "DlpJobAgent";
const APPLICATION: &str = "dlp-job-agent";

/// The structure of the runtime configuration file (config.toml).
///
/// User-facing download preferences live in the encrypted settings store;
/// this file only carries where things live and how the service binds.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Overrides the platform data directory (settings, key, pid file, dependencies).
    pub data_dir: Option<PathBuf>,
    /// Overrides `<data_dir>/dependencies` as the first place to look for yt-dlp and ffmpeg.
    pub dependencies_dir: Option<PathBuf>,
    pub server: ServerConfig,
    pub engine: EngineConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Browser origins allowed to call the API, e.g. "http://localhost:3000". Empty means none.
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
            allowed_origins: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Bind address, with the `HOST` and `PORT` environment variables taking precedence.
    pub fn bind_addr(&self) -> String {
        let host = env::var("HOST").unwrap_or_else(|_| self.host.clone());
        let port = env::var("PORT")
            .ok()
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(self.port);
        format!("{}:{}", host, port)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Cap applied when a job asks for infinite fragment retries. Absent means no cap.
    pub max_fragment_retries: Option<u32>,
}

impl EngineConfig {
    pub fn retry_limit(&self) -> RetryLimit {
        match self.max_fragment_retries {
            Some(cap) => RetryLimit::Limited(cap),
            None => RetryLimit::Infinite,
        }
    }
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
        .ok_or_else(|| anyhow!("Could not find a valid home directory to store application data"))
}

/// Returns the cross-platform path to the configuration file, creating the directory if needed.
async fn get_config_path() -> Result<PathBuf> {
    let project_dirs = project_dirs()?;
    let config_dir = project_dirs.config_dir();
    fs::create_dir_all(config_dir).await?;
    Ok(config_dir.join("config.toml"))
}

/// Loads the configuration from the file, or creates a default one if it doesn't exist.
pub async fn load_config() -> Result<Config> {
    let config_path = get_config_path().await?;
    load_config_from(&config_path).await
}

pub async fn load_config_from(config_path: &Path) -> Result<Config> {
    if !config_path.exists() {
        tracing::info!(
            "No config file found. Creating a default one at: {}",
            config_path.display()
        );
        let default_config = Config::default();
        save_config_to(config_path, &default_config).await?;
        return Ok(default_config);
    }

    let config_content = fs::read_to_string(config_path).await?;
    let config: Config = toml::from_str(&config_content)
        .map_err(|e| anyhow!("Failed to parse config file at {}: {}", config_path.display(), e))?;

    Ok(config)
}

async fn save_config_to(config_path: &Path, config: &Config) -> Result<()> {
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let toml_string = toml::to_string_pretty(config)?;
    fs::write(config_path, toml_string).await?;
    Ok(())
}

/// Resolved on-disk locations used by the agent.
#[derive(Debug, Clone, PartialEq)]
pub struct AppPaths {
    data_dir: PathBuf,
    dependencies_dir: PathBuf,
}

impl AppPaths {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let dependencies_dir = data_dir.join("dependencies");
        AppPaths { data_dir, dependencies_dir }
    }

    /// Applies the overrides from `config` on top of the platform data directory.
    pub fn resolve(config: &Config) -> Result<Self> {
        let data_dir = match &config.data_dir {
            Some(dir) => dir.clone(),
            None => project_dirs()?.data_local_dir().to_path_buf(),
        };
        let mut paths = AppPaths::new(data_dir);
        if let Some(deps) = &config.dependencies_dir {
            paths.dependencies_dir = deps.clone();
        }
        std::fs::create_dir_all(&paths.data_dir)?;
        Ok(paths)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn dependencies_dir(&self) -> &Path {
        &self.dependencies_dir
    }

    pub fn settings_file(&self) -> PathBuf {
        self.data_dir.join("settings.dat")
    }

    pub fn key_file(&self) -> PathBuf {
        self.data_dir.join(".key")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.data_dir.join("server.pid")
    }
}

/// Default download location: `<user downloads>/YouTube`.
pub fn default_download_dir() -> PathBuf {
    // Use the 'directories' crate to find the user's download directory.
    // This works on Windows, macOS, and Linux.
    UserDirs::new()
        .and_then(|dirs| dirs.download_dir().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("downloads"))
        .join("YouTube")
}
