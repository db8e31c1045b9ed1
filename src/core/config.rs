use super::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const CREDENTIAL: &str = "credential";
pub const SEARCH_PATHS: &str = "search_paths";
pub const INDEX_LOCATION: &str = "index_location";
pub const MODEL_NAME: &str = "model_name";
pub const TEMPERATURE: &str = "temperature";
pub const LOG_LEVEL: &str = "log_level";
pub const EMBEDDING_PROVIDER: &str = "embedding_provider";

/// Keys that must be present and non-empty.
pub const REQUIRED_KEYS: [&str; 3] = [CREDENTIAL, SEARCH_PATHS, INDEX_LOCATION];

pub const LOG_LEVELS: [&str; 5] = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL"];
pub const EMBEDDING_PROVIDERS: [&str; 2] = ["openai", "local"];

pub const DEFAULT_MODEL_NAME: &str = "gpt-4";
pub const DEFAULT_TEMPERATURE: f64 = 0.0;
pub const DEFAULT_LOG_LEVEL: &str = "INFO";
pub const DEFAULT_EMBEDDING_PROVIDER: &str = "openai";

const MASKED_CREDENTIAL: &str = "sk-***";

/// Application settings as an ordered key/value map.
///
/// Values are kept as JSON so the file on disk round-trips untouched;
/// typed accessors fall back to defaults for optional keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Config(BTreeMap<String, Value>);

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults for every known key. Required keys other than the index
    /// location are left empty and must be filled in by the user.
    pub fn default_config(dirs: &AppDirs) -> Self {
        let mut config = Self::new();
        config.set(MODEL_NAME, DEFAULT_MODEL_NAME);
        config.set(TEMPERATURE, DEFAULT_TEMPERATURE);
        config.set(CREDENTIAL, "");
        config.set(INDEX_LOCATION, dirs.index_dir.to_string_lossy().into_owned());
        config.set(SEARCH_PATHS, "");
        config.set(LOG_LEVEL, DEFAULT_LOG_LEVEL);
        config.set(EMBEDDING_PROVIDER, DEFAULT_EMBEDDING_PROVIDER);
        config
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        if key == CREDENTIAL {
            debug!("Updating config (in memory): {} -> {}", key, MASKED_CREDENTIAL);
        } else {
            debug!("Updating config (in memory): {} -> {}", key, value);
        }
        self.0.insert(key, value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn credential(&self) -> Option<&str> {
        self.get(CREDENTIAL)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Source directories. Accepts a single string or an array of strings.
    pub fn search_paths(&self) -> Vec<PathBuf> {
        match self.get(SEARCH_PATHS) {
            Some(Value::String(s)) if !s.trim().is_empty() => vec![PathBuf::from(s)],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from)
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn index_location(&self) -> Option<PathBuf> {
        self.get(INDEX_LOCATION)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
    }

    pub fn model_name(&self) -> &str {
        self.get(MODEL_NAME)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_MODEL_NAME)
    }

    pub fn temperature(&self) -> f64 {
        self.get(TEMPERATURE)
            .and_then(Value::as_f64)
            .unwrap_or(DEFAULT_TEMPERATURE)
    }

    pub fn log_level(&self) -> &str {
        self.get(LOG_LEVEL)
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_LOG_LEVEL)
    }

    pub fn embedding_provider(&self) -> &str {
        self.get(EMBEDDING_PROVIDER)
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_EMBEDDING_PROVIDER)
    }

    /// `tracing` filter directive for `log_level`
    pub fn log_filter(&self) -> &'static str {
        match self.log_level() {
            "DEBUG" => "debug",
            "WARNING" => "warn",
            "ERROR" | "CRITICAL" => "error",
            _ => "info",
        }
    }

    /// Validate required keys first, then the values of optional keys.
    pub fn check(&self) -> Result<()> {
        self.assert_has_required_keys()?;
        self.assert_valid_values()
    }

    /// A copy safe to print: the credential is masked.
    pub fn masked(&self) -> Config {
        let mut copy = self.clone();
        if copy.credential().is_some() {
            copy.0.insert(CREDENTIAL.to_string(), Value::from(MASKED_CREDENTIAL));
        }
        copy
    }

    fn assert_has_required_keys(&self) -> Result<()> {
        let missing_keys: BTreeSet<String> = REQUIRED_KEYS
            .iter()
            .filter(|key| !self.contains_key(key))
            .map(|key| key.to_string())
            .collect();
        if !missing_keys.is_empty() {
            return Err(Error::MissingConfigComponents(missing_keys));
        }

        let missing_values: BTreeSet<String> = REQUIRED_KEYS
            .iter()
            .filter(|key| self.get(key).map_or(true, is_empty_value))
            .map(|key| key.to_string())
            .collect();
        if !missing_values.is_empty() {
            return Err(Error::MissingConfigValue(missing_values));
        }
        Ok(())
    }

    fn assert_valid_values(&self) -> Result<()> {
        for (key, value) in self.iter() {
            match key.as_str() {
                LOG_LEVEL => check_one_of(key, value, &LOG_LEVELS)?,
                EMBEDDING_PROVIDER => check_one_of(key, value, &EMBEDDING_PROVIDERS)?,
                TEMPERATURE => {
                    let valid = value.as_f64().map_or(false, |t| (0.0..=2.0).contains(&t));
                    if !valid {
                        return Err(Error::ConfigValue {
                            key: key.clone(),
                            value: value_to_string(value),
                            allowed: "a number between 0 and 2".to_string(),
                        });
                    }
                }
                SEARCH_PATHS => {
                    let valid = match value {
                        Value::String(_) => true,
                        Value::Array(items) => items.iter().all(Value::is_string),
                        _ => false,
                    };
                    if !valid {
                        return Err(Error::ConfigValue {
                            key: key.clone(),
                            value: value_to_string(value),
                            allowed: "a path or a list of paths".to_string(),
                        });
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Config {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut config = Config::new();
        for (key, value) in iter {
            config.set(key, value);
        }
        config
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.iter().all(is_empty_value),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

fn check_one_of(key: &str, value: &Value, allowed: &[&str]) -> Result<()> {
    match value.as_str() {
        Some(v) if allowed.contains(&v) => Ok(()),
        _ => Err(Error::ConfigValue {
            key: key.to_string(),
            value: value_to_string(value),
            allowed: allowed.join(","),
        }),
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Per-user application directories
#[derive(Debug, Clone)]
pub struct AppDirs {
    /// Base directory for alphageist data
    pub base_dir: PathBuf,
    /// Path to the JSON settings file
    pub config_path: PathBuf,
    /// Default directory for the vector index
    pub index_dir: PathBuf,
    /// Directory for cached local embedding models
    pub models_dir: PathBuf,
}

impl AppDirs {
    /// Get the default data directory
    pub fn default_base_dir() -> Result<PathBuf> {
        dirs::data_dir()
            .or_else(dirs::home_dir)
            .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))
            .map(|dir| dir.join("alphageist"))
    }

    pub fn new(base_dir: Option<PathBuf>) -> Result<Self> {
        let base_dir = match base_dir {
            Some(dir) => dir,
            None => Self::default_base_dir()?,
        };

        Ok(Self {
            config_path: base_dir.join("config.json"),
            index_dir: base_dir.join("vector_db"),
            models_dir: base_dir.join("models"),
            base_dir,
        })
    }

    /// Create the application directories
    pub fn init(&self) -> Result<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        std::fs::create_dir_all(&self.index_dir)?;
        std::fs::create_dir_all(&self.models_dir)?;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.base_dir.exists() && self.config_path.exists()
    }
}

/// Durable storage for [`Config`].
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> Result<Config>;
    fn save(&self, config: &Config) -> Result<()>;
}

/// Stores the configuration as a pretty-printed JSON object.
#[derive(Debug, Clone)]
pub struct JsonConfigStore {
    path: PathBuf,
    defaults: Option<Config>,
}

impl JsonConfigStore {
    /// A store that fails to load when the file does not exist.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            defaults: None,
        }
    }

    /// A store that fills keys absent from the file (or the whole file) from `defaults`.
    pub fn with_defaults(path: impl Into<PathBuf>, defaults: Config) -> Self {
        Self {
            path: path.into(),
            defaults: Some(defaults),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for JsonConfigStore {
    fn load(&self) -> Result<Config> {
        if !self.path.exists() {
            return match &self.defaults {
                Some(defaults) => {
                    info!("No config file at {}, using defaults", self.path.display());
                    Ok(defaults.clone())
                }
                None => Err(Error::Config(format!(
                    "Config file not found: {}",
                    self.path.display()
                ))),
            };
        }

        info!("Loading config from {}", self.path.display());
        let content = std::fs::read_to_string(&self.path)?;
        let mut config: Config = serde_json::from_str(&content)?;

        if let Some(defaults) = &self.defaults {
            for (key, value) in defaults.iter() {
                if !config.contains_key(key) {
                    config.set(key.clone(), value.clone());
                }
            }
        }
        Ok(config)
    }

    fn save(&self, config: &Config) -> Result<()> {
        info!("Saving config to {}", self.path.display());
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(config)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn valid_config() -> Config {
        [
            (CREDENTIAL, Value::from("abc123")),
            (INDEX_LOCATION, Value::from(".")),
            (SEARCH_PATHS, Value::from("test/data")),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_all_required_keys_present() {
        valid_config().check().unwrap();
    }

    #[test]
    fn test_missing_required_key() {
        let mut config = valid_config();
        config.remove(INDEX_LOCATION);

        match config.check() {
            Err(Error::MissingConfigComponents(keys)) => {
                assert_eq!(keys, BTreeSet::from([INDEX_LOCATION.to_string()]));
            }
            other => panic!("expected MissingConfigComponents, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_required_value() {
        let mut config = valid_config();
        config.set(INDEX_LOCATION, "");
        config.set(SEARCH_PATHS, Vec::<String>::new());

        match config.check() {
            Err(Error::MissingConfigValue(keys)) => {
                assert!(keys.contains(INDEX_LOCATION));
                assert!(keys.contains(SEARCH_PATHS));
                assert!(!keys.contains(CREDENTIAL));
            }
            other => panic!("expected MissingConfigValue, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_keys_reported_before_values() {
        let mut config = valid_config();
        config.remove(CREDENTIAL);
        config.set(SEARCH_PATHS, "");

        assert!(matches!(config.check(), Err(Error::MissingConfigComponents(_))));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = valid_config();
        config.set(LOG_LEVEL, "not a log level");

        match config.check() {
            Err(Error::ConfigValue { key, value, .. }) => {
                assert_eq!(key, LOG_LEVEL);
                assert_eq!(value, "not a log level");
            }
            other => panic!("expected ConfigValue, got {other:?}"),
        }
    }

    #[test]
    fn test_valid_log_levels() {
        for level in LOG_LEVELS {
            let mut config = valid_config();
            config.set(LOG_LEVEL, level);
            config.check().unwrap();
        }
    }

    #[test]
    fn test_invalid_temperature() {
        let mut config = valid_config();
        config.set(TEMPERATURE, 5.0);
        assert!(matches!(config.check(), Err(Error::ConfigValue { .. })));

        config.set(TEMPERATURE, "warm");
        assert!(matches!(config.check(), Err(Error::ConfigValue { .. })));
    }

    #[test]
    fn test_search_paths_accepts_string_or_list() {
        let mut config = valid_config();
        assert_eq!(config.search_paths(), vec![PathBuf::from("test/data")]);

        config.set(SEARCH_PATHS, vec!["a", "", "b"]);
        assert_eq!(config.search_paths(), vec![PathBuf::from("a"), PathBuf::from("b")]);

        config.set(SEARCH_PATHS, 42);
        assert!(matches!(config.check(), Err(Error::ConfigValue { .. })));
    }

    #[test]
    fn test_accessor_defaults() {
        let config = valid_config();
        assert_eq!(config.model_name(), DEFAULT_MODEL_NAME);
        assert_eq!(config.temperature(), DEFAULT_TEMPERATURE);
        assert_eq!(config.log_level(), DEFAULT_LOG_LEVEL);
        assert_eq!(config.embedding_provider(), DEFAULT_EMBEDDING_PROVIDER);
        assert_eq!(config.credential(), Some("abc123"));
    }

    #[test]
    fn test_masked_hides_credential() {
        let masked = valid_config().masked();
        assert_eq!(masked.credential(), Some(MASKED_CREDENTIAL));
    }

    #[test]
    fn test_default_config_fails_check() {
        let temp_dir = TempDir::new().unwrap();
        let dirs = AppDirs::new(Some(temp_dir.path().to_path_buf())).unwrap();
        let config = Config::default_config(&dirs);

        assert_eq!(config.index_location(), Some(dirs.index_dir.clone()));
        match config.check() {
            Err(Error::MissingConfigValue(keys)) => {
                assert_eq!(
                    keys,
                    BTreeSet::from([CREDENTIAL.to_string(), SEARCH_PATHS.to_string()])
                );
            }
            other => panic!("expected MissingConfigValue, got {other:?}"),
        }
    }

    #[test]
    fn test_app_dirs_init() {
        let temp_dir = TempDir::new().unwrap();
        let dirs = AppDirs::new(Some(temp_dir.path().join("app"))).unwrap();
        assert!(!dirs.is_initialized());

        dirs.init().unwrap();
        assert!(dirs.base_dir.exists());
        assert!(dirs.index_dir.exists());
        assert!(dirs.models_dir.exists());
    }

    #[test]
    fn test_store_save_then_load() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonConfigStore::new(temp_dir.path().join("config.json"));
        store.save(&valid_config()).unwrap();

        assert_eq!(store.load().unwrap(), valid_config());
    }

    #[test]
    fn test_store_fills_missing_keys_from_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        std::fs::write(&path, r#"{"key1": "value1"}"#).unwrap();

        let defaults: Config = [("key1", "default1"), ("key2", "default2")].into_iter().collect();
        let loaded = JsonConfigStore::with_defaults(&path, defaults).load().unwrap();

        let expected: Config = [("key1", "value1"), ("key2", "default2")].into_iter().collect();
        assert_eq!(loaded, expected);
    }

    #[test]
    fn test_store_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("absent.json");

        assert!(matches!(JsonConfigStore::new(&path).load(), Err(Error::Config(_))));

        let defaults: Config = [("key", "default_value")].into_iter().collect();
        let loaded = JsonConfigStore::with_defaults(&path, defaults.clone()).load().unwrap();
        assert_eq!(loaded, defaults);
    }

    #[test]
    fn test_store_unparsable_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        std::fs::write(&path, "{ this is not json").unwrap();

        assert!(matches!(JsonConfigStore::new(&path).load(), Err(Error::Json(_))));
    }

    #[test]
    fn test_log_filter() {
        let filter = |level: &str| -> &'static str {
            let config: Config = [(LOG_LEVEL, level)].into_iter().collect();
            config.log_filter()
        };
        assert_eq!(filter("DEBUG"), "debug");
        assert_eq!(filter("INFO"), "info");
        assert_eq!(filter("WARNING"), "warn");
        assert_eq!(filter("CRITICAL"), "error");
        assert_eq!(Config::new().log_filter(), "info");
    }
}
