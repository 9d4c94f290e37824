use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const CORVID_DIR: &str = ".corvid";
const DB_FILE: &str = "corvid.db";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SecurityConfig {
    pub max_message_length: usize,
    pub max_requests_per_window: usize,
    pub rate_limit_window_secs: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_message_length: 5000,
            max_requests_per_window: 100,
            rate_limit_window_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_tool_round_trips: usize,
    pub model_round_trip_timeout_secs: u64,
    pub tool_invocation_timeout_secs: u64,
    pub context_window_budget_tokens: usize,
    pub history_limit: usize,
    pub session_idle_timeout_hours: i64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_tool_round_trips: 5,
            model_round_trip_timeout_secs: 30,
            tool_invocation_timeout_secs: 10,
            context_window_budget_tokens: 4000,
            history_limit: 20,
            session_idle_timeout_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub provider: Option<String>,
    pub api_key: String,
    pub base_url: Option<String>,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub weather_api_key: Option<String>,
    pub db_path: Option<PathBuf>,
    pub ephemeral: bool,
    pub security: SecurityConfig,
    pub limits: LimitsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            provider: None,
            api_key: String::new(),
            base_url: None,
            model: "gpt-4o".to_string(),
            temperature: 0.7,
            max_tokens: 1000,
            weather_api_key: None,
            db_path: None,
            ephemeral: false,
            security: SecurityConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

pub fn get_corvid_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(CORVID_DIR)
}

pub fn get_config_path() -> PathBuf {
    get_corvid_dir().join("config.toml")
}

pub fn ensure_corvid_dir() -> Result<PathBuf> {
    let corvid_dir = get_corvid_dir();

    if !corvid_dir.exists() {
        std::fs::create_dir_all(&corvid_dir).with_context(|| {
            format!(
                "Failed to create corvid directory at {}",
                corvid_dir.display()
            )
        })?;
    }

    Ok(corvid_dir)
}

impl Config {
    pub fn load_or_init() -> Result<Self> {
        if config_exists() {
            load_config()
        } else {
            Ok(Config::default())
        }
    }

    /// Where the SQLite database lives when no explicit path is configured.
    pub fn resolved_db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| get_corvid_dir().join(DB_FILE))
    }
}

pub fn load_config() -> Result<Config> {
    let config_path = get_config_path();

    let content = std::fs::read_to_string(&config_path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            anyhow::anyhow!("Config file not found at {}", config_path.display())
        } else {
            anyhow::anyhow!("Failed to read config from {}: {}", config_path.display(), e)
        }
    })?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config from {}", config_path.display()))?;

    Ok(config)
}

pub fn save_config(config: &Config) -> Result<()> {
    ensure_corvid_dir()?;

    let config_path = get_config_path();
    let content =
        toml::to_string_pretty(config).with_context(|| "Failed to serialize config to TOML")?;

    std::fs::write(&config_path, content)
        .with_context(|| format!("Failed to write config to {}", config_path.display()))?;

    Ok(())
}

pub fn config_exists() -> bool {
    get_config_path().exists()
}
