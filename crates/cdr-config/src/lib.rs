//! CDR service configuration
//!
//! Sources, later ones winning:
//! 1. `.env` in the working directory (optional)
//! 2. TOML file named by `CDR_CONFIG_FILE` (optional)
//! 3. Process environment
//!
//! Validation reports every problem at once so a misconfigured deployment can
//! be fixed in a single pass.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use cdr_common::logging::LogFormat;
use thiserror::Error;
use tracing::debug;

/// Environment variable naming the optional TOML file
pub const CONFIG_FILE_ENV: &str = "CDR_CONFIG_FILE";

/// Known keys as `(environment name, TOML key)`
const KEYS: &[(&str, &str)] = &[
    ("RABBITMQ_URL", "rabbitmq_url"),
    ("POSTGRES_URL", "postgres_url"),
    ("METRICS_PORT", "metrics_port"),
    ("LOG_LEVEL", "log_level"),
    ("LOG_FORMAT", "log_format"),
    ("CDR_EXCHANGE", "exchange"),
    ("CDR_QUEUE", "queue"),
    ("CDR_DEAD_LETTER_EXCHANGE", "dead_letter_exchange"),
    ("CDR_DEAD_LETTER_QUEUE", "dead_letter_queue"),
    ("CDR_WORKER_LIMIT", "worker_limit"),
    ("CDR_SHUTDOWN_GRACE_SECS", "shutdown_grace_secs"),
    ("CDR_BACKOFF_INITIAL_MS", "backoff_initial_ms"),
    ("CDR_BACKOFF_MAX_MS", "backoff_max_ms"),
    ("CDR_DB_MAX_CONNECTIONS", "db_max_connections"),
    ("CDR_DB_ACQUIRE_TIMEOUT_SECS", "db_acquire_timeout_secs"),
    ("CDR_INFER_ANSWERED", "infer_answered"),
    ("CDR_ALLOW_LATE_IDENTITY", "allow_late_identity"),
];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration: {}", .problems.join("; "))]
    Invalid { problems: Vec<String> },

    #[error("failed to read config file {path}: {source}")]
    File {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Broker names and dispatch sizing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub exchange: String,
    pub queue: String,
    pub dead_letter_exchange: String,
    pub dead_letter_queue: String,
    /// Worker pool size; also used as the AMQP prefetch count
    pub worker_limit: u16,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

/// Reconciliation policy switches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyConfig {
    /// Infer ANSWERED from duration and normal clearing when no answer event arrived
    pub infer_answered: bool,
    /// Accept identity updates for calls that are already COMPLETED
    pub allow_late_identity: bool,
}

/// Fully validated process configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub rabbitmq_url: String,
    pub postgres_url: String,
    pub metrics_port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub broker: BrokerConfig,
    pub database: DatabaseConfig,
    pub policy: PolicyConfig,
}

impl Config {
    /// Load from `.env`, the optional TOML file and the process environment.
    pub fn load() -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!(path = %path.display(), "Loaded .env file");
        }

        let lookup = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        let file = lookup(CONFIG_FILE_ENV).map(PathBuf::from);

        Self::from_sources(file.as_deref(), lookup)
    }

    /// Build from an optional TOML file overlaid by `lookup`.
    pub fn from_sources<F>(file: Option<&Path>, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut values = match file {
            Some(path) => read_file(path)?,
            None => HashMap::new(),
        };

        for (env_key, _) in KEYS {
            if let Some(value) = lookup(env_key) {
                values.insert(env_key.to_string(), value);
            }
        }

        Self::from_values(&values)
    }

    fn from_values(values: &HashMap<String, String>) -> Result<Self> {
        let mut reader = Reader::new(values);

        let rabbitmq_url = reader.required("RABBITMQ_URL");
        let postgres_url = reader.required("POSTGRES_URL");
        let metrics_port: u16 = reader.parsed("METRICS_PORT", 9092, "a port number");
        let log_level = reader.string("LOG_LEVEL", "info");
        let log_format: LogFormat = reader.parsed("LOG_FORMAT", LogFormat::Json, "one of json, pretty, compact");

        let worker_limit: u16 = reader.parsed("CDR_WORKER_LIMIT", 10, "an integer between 1 and 65535");
        if worker_limit == 0 {
            reader.problem("CDR_WORKER_LIMIT must be at least 1");
        }

        let backoff_initial_ms: u64 = reader.parsed("CDR_BACKOFF_INITIAL_MS", 1000, "a number of milliseconds");
        let backoff_max_ms: u64 = reader.parsed("CDR_BACKOFF_MAX_MS", 30_000, "a number of milliseconds");
        if backoff_initial_ms == 0 {
            reader.problem("CDR_BACKOFF_INITIAL_MS must be greater than 0");
        }
        if backoff_max_ms < backoff_initial_ms {
            reader.problem("CDR_BACKOFF_MAX_MS must not be smaller than CDR_BACKOFF_INITIAL_MS");
        }

        let broker = BrokerConfig {
            exchange: reader.string("CDR_EXCHANGE", "sentiric_events"),
            queue: reader.string("CDR_QUEUE", "sentiric.cdr_service.events"),
            dead_letter_exchange: reader.string("CDR_DEAD_LETTER_EXCHANGE", "sentiric_events.dlx"),
            dead_letter_queue: reader.string("CDR_DEAD_LETTER_QUEUE", "sentiric.cdr_service.events.dlq"),
            worker_limit,
            backoff_initial: Duration::from_millis(backoff_initial_ms),
            backoff_max: Duration::from_millis(backoff_max_ms),
            shutdown_grace: Duration::from_secs(reader.parsed("CDR_SHUTDOWN_GRACE_SECS", 10, "a number of seconds")),
        };

        let max_connections: u32 = reader.parsed("CDR_DB_MAX_CONNECTIONS", 20, "a positive integer");
        if max_connections == 0 {
            reader.problem("CDR_DB_MAX_CONNECTIONS must be at least 1");
        }
        let database = DatabaseConfig {
            max_connections,
            acquire_timeout: Duration::from_secs(reader.parsed("CDR_DB_ACQUIRE_TIMEOUT_SECS", 5, "a number of seconds")),
        };

        let policy = PolicyConfig {
            infer_answered: reader.flag("CDR_INFER_ANSWERED", true),
            allow_late_identity: reader.flag("CDR_ALLOW_LATE_IDENTITY", true),
        };

        reader.finish()?;

        Ok(Self {
            rabbitmq_url: rabbitmq_url.unwrap_or_default(),
            postgres_url: postgres_url.unwrap_or_default(),
            metrics_port,
            log_level,
            log_format,
            broker,
            database,
            policy,
        })
    }
}

/// Collects values and problems while the config is being assembled
struct Reader<'a> {
    values: &'a HashMap<String, String>,
    problems: Vec<String>,
}

impl<'a> Reader<'a> {
    fn new(values: &'a HashMap<String, String>) -> Self {
        Self {
            values,
            problems: Vec::new(),
        }
    }

    fn get(&self, key: &str) -> Option<&'a str> {
        let values: &'a HashMap<String, String> = self.values;
        values
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn problem(&mut self, message: impl Into<String>) {
        self.problems.push(message.into());
    }

    fn required(&mut self, key: &str) -> Option<String> {
        let value = self.get(key).map(str::to_string);
        if value.is_none() {
            self.problem(format!("missing {}", key));
        }
        value
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    fn parsed<T: FromStr>(&mut self, key: &str, default: T, expected: &str) -> T {
        let Some(raw) = self.get(key) else {
            return default;
        };
        match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                let message = format!("{} must be {} (got {:?})", key, expected, raw);
                self.problem(message);
                default
            }
        }
    }

    fn flag(&mut self, key: &str, default: bool) -> bool {
        let Some(raw) = self.get(key) else {
            return default;
        };
        match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                let message = format!("{} must be a boolean (got {:?})", key, raw);
                self.problem(message);
                default
            }
        }
    }

    fn finish(self) -> Result<()> {
        if self.problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid {
                problems: self.problems,
            })
        }
    }
}

/// Read a flat TOML file into env-keyed values.
fn read_file(path: &Path) -> Result<HashMap<String, String>> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::File {
        path: path.to_path_buf(),
        source,
    })?;
    let table: toml::Table = content.parse().map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let mut values = HashMap::new();
    for (env_key, file_key) in KEYS {
        let Some(value) = table.get(*file_key) else {
            continue;
        };
        let text = match value {
            toml::Value::String(s) => s.clone(),
            toml::Value::Integer(i) => i.to_string(),
            toml::Value::Boolean(b) => b.to_string(),
            toml::Value::Float(f) => f.to_string(),
            other => other.to_string(),
        };
        values.insert(env_key.to_string(), text);
    }

    debug!(path = %path.display(), keys = values.len(), "Loaded config file");
    Ok(values)
}

/// Hide credentials in a connection URL before logging it.
pub fn redact_url(url: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return url.to_string();
    };
    let rest = &url[scheme_end + 3..];
    match rest.rfind('@') {
        Some(at) => format!("{}://***@{}", &url[..scheme_end], &rest[at + 1..]),
        None => url.to_string(),
    }
}
