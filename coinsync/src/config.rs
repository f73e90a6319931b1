use crate::derivation::MAX_ACCOUNT_INDEX;

use std::{fmt, path::PathBuf, str::FromStr, time::Duration};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

fn deserialize_fromstr<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    let string = String::deserialize(deserializer)?;
    T::from_str(&string)
        .map_err(|e| de::Error::custom(format!("Error parsing '{}': {}", string, e)))
}

pub fn serialize_to_string<T: std::fmt::Display, S: Serializer>(
    field: T,
    s: S,
) -> Result<S::Ok, S::Error> {
    s.serialize_str(&field.to_string())
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = u64::deserialize(deserializer)?;
    Ok(Duration::from_secs(secs))
}

pub fn serialize_duration<S: Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(duration.as_secs())
}

fn default_loglevel() -> log::LevelFilter {
    log::LevelFilter::Info
}

fn default_max_index() -> u32 {
    MAX_ACCOUNT_INDEX
}

fn default_retention() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_cache_entries() -> usize {
    100
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(5 * 60)
}

/// Settings of the account discovery.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DiscoveryConfig {
    /// Exclusive upper bound on the scanned account indexes for iterable derivation modes.
    #[serde(default = "default_max_index")]
    pub max_index: u32,
    /// Overrides the gap limit of every derivation mode.
    #[serde(default)]
    pub gap_limit: Option<u32>,
    /// Overrides whether every derivation mode surfaces its first empty account.
    #[serde(default)]
    pub show_new_account: Option<bool>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_index: default_max_index(),
            gap_limit: None,
            show_new_account: None,
        }
    }
}

/// Settings of the incremental synchronization, also handed to chain data sources.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SyncConfig {
    /// How long optimistic operations are kept if the chain never reports them.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_retention",
        rename = "pending_retention_secs"
    )]
    pub pending_retention: Duration,
    /// Maximum number of operations a data source should return in one pull.
    #[serde(default)]
    pub max_operations: Option<usize>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            pending_retention: default_retention(),
            max_operations: None,
        }
    }
}

/// Settings of a computation cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,
    /// How long a computed value stays valid, from the end of its computation.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_cache_ttl",
        rename = "ttl_secs"
    )]
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_cache_entries(),
            ttl: default_cache_ttl(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// What messages to log
    #[serde(
        deserialize_with = "deserialize_fromstr",
        serialize_with = "serialize_to_string",
        default = "default_loglevel"
    )]
    pub log_level: log::LevelFilter,
    /// Also append logs to this file.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_loglevel(),
            log_file: None,
            discovery: DiscoveryConfig::default(),
            sync: SyncConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

#[derive(PartialEq, Eq, Debug)]
pub enum ConfigError {
    DatadirNotFound,
    FileNotFound,
    ReadingFile(String),
    Unexpected(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self {
            Self::DatadirNotFound => write!(f, "Could not locate the configuration directory."),
            Self::FileNotFound => write!(f, "Could not locate the configuration file."),
            Self::ReadingFile(e) => write!(f, "Failed to read configuration file: {}", e),
            Self::Unexpected(e) => write!(f, "Configuration error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::FileNotFound,
            _ => Self::ReadingFile(e.to_string()),
        }
    }
}

/// Get the absolute path to the coinsync configuration folder.
///
/// This is a "coinsync" directory in the XDG standard configuration directory for all OSes but
/// Linux-based ones, for which it's `~/.coinsync`.
pub fn config_folder_path() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    let configs_dir = dirs::home_dir();

    #[cfg(not(target_os = "linux"))]
    let configs_dir = dirs::config_dir();

    configs_dir.map(|mut path| {
        #[cfg(target_os = "linux")]
        path.push(".coinsync");
        #[cfg(not(target_os = "linux"))]
        path.push("Coinsync");

        path
    })
}

fn config_file_path() -> Option<PathBuf> {
    config_folder_path().map(|mut path| {
        path.push("config.toml");
        path
    })
}

impl Config {
    /// Read the configuration from a TOML file, by default `config.toml` in the configuration
    /// folder. Missing settings take their default value.
    pub fn from_file(custom_path: Option<PathBuf>) -> Result<Config, ConfigError> {
        let config_file = match custom_path {
            Some(path) => path,
            None => config_file_path().ok_or(ConfigError::DatadirNotFound)?,
        };

        let config = toml::from_slice::<Config>(&std::fs::read(config_file)?)
            .map_err(|e| ConfigError::ReadingFile(format!("Parsing configuration file: {}", e)))?;
        config.check()?;

        Ok(config)
    }

    fn check(&self) -> Result<(), ConfigError> {
        if self.cache.max_entries == 0 {
            return Err(ConfigError::Unexpected(
                "The cache must be able to hold at least one entry.".to_string(),
            ));
        }
        if self.discovery.max_index == 0 {
            return Err(ConfigError::Unexpected(
                "Discovery must be allowed to scan at least one account index.".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    #[test]
    fn toml_config() {
        let toml_str = r#"
            log_level = "debug"
            log_file = "/var/log/coinsync.log"

            [discovery]
            max_index = 20
            gap_limit = 2
            show_new_account = false

            [sync]
            pending_retention_secs = 60
            max_operations = 500

            [cache]
            max_entries = 10
            ttl_secs = 120
        "#;
        let config: Config = toml::from_str(toml_str).expect("Deserializing toml_str");
        assert_eq!(config.log_level, log::LevelFilter::Debug);
        assert_eq!(config.log_file, Some(PathBuf::from("/var/log/coinsync.log")));
        assert_eq!(config.discovery.max_index, 20);
        assert_eq!(config.discovery.gap_limit, Some(2));
        assert_eq!(config.discovery.show_new_account, Some(false));
        assert_eq!(config.sync.pending_retention, Duration::from_secs(60));
        assert_eq!(config.sync.max_operations, Some(500));
        assert_eq!(config.cache.max_entries, 10);
        assert_eq!(config.cache.ttl, Duration::from_secs(120));

        let serialized = toml::to_string_pretty(&config).expect("Serializing config");
        let reparsed: Config = toml::from_str(&serialized).expect("Deserializing serialized");
        assert_eq!(reparsed, config);

        // Everything has a default.
        let config: Config = toml::from_str("").expect("Empty config");
        assert_eq!(config, Config::default());
        assert_eq!(config.discovery.max_index, 255);
        assert_eq!(config.cache.ttl, Duration::from_secs(300));

        // Invalid log level
        let toml_str = r#"log_level = "loud""#;
        toml::from_str::<Config>(toml_str).expect_err("Invalid log level");
    }

    #[test]
    fn config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[cache]\nmax_entries = 3").unwrap();
        let config = Config::from_file(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.cache.max_entries, 3);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[cache]\nmax_entries = 0").unwrap();
        assert!(matches!(
            Config::from_file(Some(file.path().to_path_buf())),
            Err(ConfigError::Unexpected(_))
        ));

        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            Config::from_file(Some(dir.path().join("missing.toml"))),
            Err(ConfigError::FileNotFound)
        );
    }
}
