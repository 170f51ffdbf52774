use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

pub const CONFIG_FILE: &str = "office.toml";
pub const DATA_DIR_ENV: &str = "OPS_OFFICE_DATA_DIR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not determine a home directory; set OPS_OFFICE_DATA_DIR")]
    NoHome,
    #[error("Cannot create data directory {path:?}: {source}")]
    DataDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Cannot read {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Missing LLM API key (set {0})")]
    MissingApiKey(String),
}

fn default_base_url() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_models() -> Vec<String> {
    vec!["gpt-4o-mini".to_string()]
}

fn default_timeout_secs() -> u64 {
    45
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_base_ms() -> u64 {
    3000
}

fn default_api_key_env() -> String {
    "LLM_API_KEY".to_string()
}

fn default_poll_secs() -> u64 {
    60
}

fn default_heartbeat_cron() -> String {
    "0 */5 * * * *".to_string()
}

fn default_true() -> bool {
    true
}

fn default_trigger_budget_ms() -> u64 {
    4000
}

fn default_reaction_budget_ms() -> u64 {
    3000
}

fn default_stale_minutes() -> i64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_models")]
    pub models: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Resolved from the environment, never read from the file.
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            models: default_models(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            api_key_env: default_api_key_env(),
            api_key: None,
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ConfigError::MissingApiKey(self.api_key_env.clone()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_poll_secs")]
    pub mission_poll_secs: u64,
    #[serde(default = "default_poll_secs")]
    pub roundtable_poll_secs: u64,
    #[serde(default = "default_poll_secs")]
    pub initiative_poll_secs: u64,
    #[serde(default = "default_heartbeat_cron")]
    pub heartbeat_cron: String,
    #[serde(default = "default_true")]
    pub turn_delay: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            mission_poll_secs: default_poll_secs(),
            roundtable_poll_secs: default_poll_secs(),
            initiative_poll_secs: default_poll_secs(),
            heartbeat_cron: default_heartbeat_cron(),
            turn_delay: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_trigger_budget_ms")]
    pub trigger_budget_ms: u64,
    #[serde(default = "default_reaction_budget_ms")]
    pub reaction_budget_ms: u64,
    #[serde(default = "default_stale_minutes")]
    pub stale_step_minutes: i64,
    #[serde(default = "default_stale_minutes")]
    pub stale_reaction_minutes: i64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            trigger_budget_ms: default_trigger_budget_ms(),
            reaction_budget_ms: default_reaction_budget_ms(),
            stale_step_minutes: default_stale_minutes(),
            stale_reaction_minutes: default_stale_minutes(),
        }
    }
}

impl HeartbeatConfig {
    pub fn trigger_budget(&self) -> Duration {
        Duration::from_millis(self.trigger_budget_ms)
    }

    pub fn reaction_budget(&self) -> Duration {
        Duration::from_millis(self.reaction_budget_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OfficeConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(skip)]
    pub data_dir: PathBuf,
}

/// Lookup for environment variables, swappable in tests.
pub trait Env {
    fn var(&self, key: &str) -> Option<String>;
}

pub struct ProcessEnv;

impl Env for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.trim().is_empty())
    }
}

pub fn default_data_dir(env: &dyn Env) -> Result<PathBuf, ConfigError> {
    if let Some(dir) = env.var(DATA_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }
    dirs::home_dir()
        .map(|home| home.join(".ops-office"))
        .ok_or(ConfigError::NoHome)
}

impl OfficeConfig {
    /// Resolve the data directory, create it, read `office.toml` when present and
    /// apply environment overrides.
    pub fn load(env: &dyn Env) -> Result<Self, ConfigError> {
        let data_dir = default_data_dir(env)?;
        Self::load_from(&data_dir, env)
    }

    pub fn load_from(data_dir: &Path, env: &dyn Env) -> Result<Self, ConfigError> {
        std::fs::create_dir_all(data_dir).map_err(|source| ConfigError::DataDir {
            path: data_dir.to_path_buf(),
            source,
        })?;

        let path = data_dir.join(CONFIG_FILE);
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            toml::from_str::<OfficeConfig>(&raw).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?
        } else {
            info!("No {} in {:?}, using defaults", CONFIG_FILE, data_dir);
            OfficeConfig::default()
        };
        config.data_dir = data_dir.to_path_buf();
        config.apply_env(env);
        Ok(config)
    }

    fn apply_env(&mut self, env: &dyn Env) {
        if let Some(url) = env.var("LLM_BASE_URL") {
            self.llm.base_url = url;
        }
        if let Some(model) = env.var("LLM_MODEL") {
            self.llm.models.retain(|m| m != &model);
            self.llm.models.insert(0, model);
        }
        self.llm.api_key = env.var(&self.llm.api_key_env);
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapEnv(HashMap<&'static str, &'static str>);

    impl Env for MapEnv {
        fn var(&self, key: &str) -> Option<String> {
            self.0.get(key).map(|v| v.to_string())
        }
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = OfficeConfig::load_from(dir.path(), &MapEnv(HashMap::new())).unwrap();
        assert_eq!(config.llm.models, vec!["gpt-4o-mini"]);
        assert_eq!(config.workers.heartbeat_cron, "0 */5 * * * *");
        assert_eq!(config.heartbeat.trigger_budget(), Duration::from_millis(4000));
        assert!(config.workers.turn_delay);
        assert!(matches!(
            config.llm.require_api_key(),
            Err(ConfigError::MissingApiKey(var)) if var == "LLM_API_KEY"
        ));
    }

    #[test]
    fn file_values_and_env_overrides_combine() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "[llm]\nmodels = [\"small\", \"large\"]\napi_key_env = \"OFFICE_KEY\"\n\n\
             [workers]\nturn_delay = false\n\n[heartbeat]\nstale_step_minutes = 10\n",
        )
        .unwrap();
        let env = MapEnv(HashMap::from([
            ("LLM_MODEL", "large"),
            ("LLM_BASE_URL", "http://127.0.0.1:9/v1/chat/completions"),
            ("OFFICE_KEY", "secret"),
        ]));
        let config = OfficeConfig::load_from(dir.path(), &env).unwrap();
        assert_eq!(config.llm.models, vec!["large", "small"]);
        assert_eq!(config.llm.base_url, "http://127.0.0.1:9/v1/chat/completions");
        assert_eq!(config.llm.require_api_key().unwrap(), "secret");
        assert!(!config.workers.turn_delay);
        assert_eq!(config.heartbeat.stale_step_minutes, 10);
        assert_eq!(config.heartbeat.stale_reaction_minutes, 30);
        assert_eq!(config.workers.mission_poll_secs, 60);
    }

    #[test]
    fn malformed_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "[llm\nmodels = 3").unwrap();
        let err = OfficeConfig::load_from(dir.path(), &MapEnv(HashMap::new())).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn data_dir_env_wins() {
        let env = MapEnv(HashMap::from([(DATA_DIR_ENV, "/tmp/office-test")]));
        assert_eq!(default_data_dir(&env).unwrap(), PathBuf::from("/tmp/office-test"));
    }
}
