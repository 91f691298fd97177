use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub server: ServerConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub monitor: MonitorConfig,
  /// Pending-record database (defaults to the platform data dir)
  pub database: Option<PathBuf>,
  /// Response cache database (defaults to the platform data dir)
  pub cache_database: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  pub url: String,
  #[serde(default = "default_residents_path")]
  pub residents_path: String,
  #[serde(default = "default_sync_path")]
  pub sync_path: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

fn default_residents_path() -> String {
  "/api/moradores-offline/".to_string()
}

fn default_sync_path() -> String {
  "/api/sync-offline/".to_string()
}

fn default_timeout_secs() -> u64 {
  15
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// Name of the current cache generation
  #[serde(default = "default_generation")]
  pub generation: String,
  /// App shell assets fetched at install time
  #[serde(default = "default_assets")]
  pub assets: Vec<String>,
  /// URL fragments that are always served from the network
  #[serde(default = "default_bypass")]
  pub bypass: Vec<String>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      generation: default_generation(),
      assets: default_assets(),
      bypass: default_bypass(),
    }
  }
}

fn default_true() -> bool {
  true
}

fn default_generation() -> String {
  "splash-rc-v2".to_string()
}

fn default_assets() -> Vec<String> {
  [
    "/",
    "/img/logo.ico",
    "/portaria/",
    "/portaria/visitantes/",
    "/portaria/encomendas/",
    "/portaria/solicitacoes/",
    "/sindico/visitantes/",
    "/sindico/encomendas/",
    "https://cdn.jsdelivr.net/npm/bootstrap@5.3.2/dist/css/bootstrap.min.css",
    "https://cdn.jsdelivr.net/npm/bootstrap-icons@1.11.1/font/bootstrap-icons.css",
    "https://cdn.jsdelivr.net/npm/bootstrap@5.3.2/dist/js/bootstrap.bundle.min.js",
  ]
  .into_iter()
  .map(String::from)
  .collect()
}

pub fn default_bypass() -> Vec<String> {
  [
    "/login",
    "/logout",
    "/admin",
    "/password_reset",
    "/reset",
    "/api/",
    "/sindico/",
    "/morador/",
  ]
  .into_iter()
  .map(String::from)
  .collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
  /// How often the server is probed for reachability
  #[serde(default = "default_probe_interval")]
  pub probe_interval_ms: u64,
  /// Delay between an online transition and the sync attempt
  #[serde(default = "default_stabilize_delay")]
  pub stabilize_delay_ms: u64,
  /// Delay before reloading after an automatic sync
  #[serde(default = "default_reload_delay")]
  pub reload_delay_ms: u64,
  /// Delay before reloading after a manual sync
  #[serde(default = "default_manual_reload_delay")]
  pub manual_reload_delay_ms: u64,
}

impl Default for MonitorConfig {
  fn default() -> Self {
    Self {
      probe_interval_ms: default_probe_interval(),
      stabilize_delay_ms: default_stabilize_delay(),
      reload_delay_ms: default_reload_delay(),
      manual_reload_delay_ms: default_manual_reload_delay(),
    }
  }
}

fn default_probe_interval() -> u64 {
  5000
}

fn default_stabilize_delay() -> u64 {
  2000
}

fn default_reload_delay() -> u64 {
  2000
}

fn default_manual_reload_delay() -> u64 {
  1500
}

impl MonitorConfig {
  pub fn probe_interval(&self) -> Duration {
    Duration::from_millis(self.probe_interval_ms)
  }

  pub fn stabilize_delay(&self) -> Duration {
    Duration::from_millis(self.stabilize_delay_ms)
  }

  pub fn reload_delay(&self) -> Duration {
    Duration::from_millis(self.reload_delay_ms)
  }

  pub fn manual_reload_delay(&self) -> Duration {
    Duration::from_millis(self.manual_reload_delay_ms)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./portaria.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/portaria-offline/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/portaria-offline/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("portaria.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("portaria-offline").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    url::Url::parse(&config.server.url)
      .map_err(|e| eyre!("Invalid server url '{}': {}", config.server.url, e))?;
    Ok(config)
  }

  /// Directory for databases and logs.
  pub fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("portaria-offline"))
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(p) => Ok(p.clone()),
      None => Ok(Self::data_dir()?.join("offline.db")),
    }
  }

  pub fn cache_database_path(&self) -> Result<PathBuf> {
    match &self.cache_database {
      Some(p) => Ok(p.clone()),
      None => Ok(Self::data_dir()?.join("shell-cache.db")),
    }
  }

  /// Session cookie forwarded to the server, if any.
  ///
  /// Reads PORTARIA_SESSION.
  pub fn session_cookie() -> Option<String> {
    std::env::var("PORTARIA_SESSION").ok().filter(|s| !s.is_empty())
  }
}
