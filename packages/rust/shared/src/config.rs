//! Application configuration for CarbonBOM.
//!
//! User config lives at `~/.carbonbom/carbonbom.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CarbonBomError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "carbonbom.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".carbonbom";

// ---------------------------------------------------------------------------
// Config structs (matching carbonbom.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Reasoning-oracle settings.
    #[serde(default)]
    pub oracle: OracleConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Default database file path.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Maximum decomposition depth; tiers beyond this are terminal.
    #[serde(default = "default_depth_cap")]
    pub depth_cap: u32,

    /// Sibling dedup window in seconds, measured from a group's earliest member.
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,

    /// Seconds between convergence poll cycles.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Poll cycles before a tier is declared stuck.
    #[serde(default = "default_max_poll_cycles")]
    pub max_poll_cycles: u32,

    /// Follow-up turns allowed per elicitation chat loop.
    #[serde(default = "default_max_follow_ups")]
    pub max_follow_ups: u32,

    /// Maximum concurrent enrichment tasks per batch.
    #[serde(default = "default_enrich_concurrency")]
    pub enrich_concurrency: u32,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            depth_cap: default_depth_cap(),
            dedup_window_secs: default_dedup_window_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            max_poll_cycles: default_max_poll_cycles(),
            max_follow_ups: default_max_follow_ups(),
            enrich_concurrency: default_enrich_concurrency(),
        }
    }
}

fn default_db_path() -> String {
    "~/.carbonbom/carbonbom.db".into()
}
fn default_depth_cap() -> u32 {
    5
}
fn default_dedup_window_secs() -> u64 {
    600
}
fn default_poll_interval_secs() -> u64 {
    5
}
fn default_max_poll_cycles() -> u32 {
    120
}
fn default_max_follow_ups() -> u32 {
    4
}
fn default_enrich_concurrency() -> u32 {
    8
}

/// `[oracle]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// API base URL for the chat-completion endpoint.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Primary model used for all first attempts.
    #[serde(default = "default_primary_model")]
    pub primary_model: String,

    /// Stronger model used when the primary's answer is rejected.
    #[serde(default = "default_secondary_model")]
    pub secondary_model: String,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            primary_model: default_primary_model(),
            secondary_model: default_secondary_model(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_primary_model() -> String {
    "google/gemini-2.5-flash".into()
}
fn default_secondary_model() -> String {
    "google/gemini-2.5-pro".into()
}

// ---------------------------------------------------------------------------
// Engine config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime engine configuration — merged from config file + CLI flags.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum decomposition depth.
    pub depth_cap: u32,
    /// Sibling dedup window in seconds.
    pub dedup_window_secs: u64,
    /// Seconds between convergence poll cycles.
    pub poll_interval_secs: u64,
    /// Poll cycles before a tier is declared stuck.
    pub max_poll_cycles: u32,
    /// Follow-up turns allowed per elicitation chat loop.
    pub max_follow_ups: u32,
    /// Maximum concurrent enrichment tasks per batch.
    pub enrich_concurrency: u32,
    /// Primary oracle model.
    pub primary_model: String,
    /// Escalation oracle model.
    pub secondary_model: String,
}

impl From<&AppConfig> for EngineConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            depth_cap: config.defaults.depth_cap,
            dedup_window_secs: config.defaults.dedup_window_secs,
            poll_interval_secs: config.defaults.poll_interval_secs,
            max_poll_cycles: config.defaults.max_poll_cycles,
            max_follow_ups: config.defaults.max_follow_ups,
            enrich_concurrency: config.defaults.enrich_concurrency,
            primary_model: config.oracle.primary_model.clone(),
            secondary_model: config.oracle.secondary_model.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.carbonbom/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| CarbonBomError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.carbonbom/carbonbom.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| CarbonBomError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| CarbonBomError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| CarbonBomError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| CarbonBomError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| CarbonBomError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that the oracle API key env var is set and non-empty.
pub fn validate_api_key(config: &AppConfig) -> Result<()> {
    let var_name = &config.oracle.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(()),
        _ => Err(CarbonBomError::config(format!(
            "oracle API key not found. Set the {var_name} environment variable."
        ))),
    }
}
