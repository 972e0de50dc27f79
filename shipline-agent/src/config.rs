/// Agent configuration
///
/// Loaded in layers, later sources winning:
///
/// 1. `.env` (via `dotenvy`, exported into the process environment)
/// 2. the TOML file named by `SHIPLINE_CONFIG` (default `shipline.toml`),
///    optional
/// 3. `SHIPLINE__*` environment variables, `__` separating path segments
///    (e.g. `SHIPLINE__OUTPUT__REDIS__KEY=events`)
///
/// # Example
///
/// ```toml
/// [agent]
/// name = "shipline"
/// batch_size = 512
/// flush_interval = "1s"
/// tags = ["edge", "eu-west"]
///
/// [backoff]
/// init = "1s"
/// max = "60s"
/// max_retries = 3
///
/// [logging]
/// format = "json"
///
/// [output.redis]
/// hosts = ["localhost:6379"]
/// key = "shipline"
/// datatype = "list"
/// ```

use anyhow::{bail, Context};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use shipline_output::output::config::duration_serde;
use shipline_output::output::RedisOutputConfig;
use std::env;
use std::path::Path;
use std::time::Duration;

/// Default configuration file
pub const DEFAULT_CONFIG_FILE: &str = "shipline.toml";

/// Environment prefix for overrides
pub const ENV_PREFIX: &str = "SHIPLINE";

/// Complete agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub agent: AgentSettings,

    #[serde(default)]
    pub backoff: BackoffSettings,

    #[serde(default)]
    pub logging: LoggingSettings,

    pub output: OutputSettings,
}

/// Batching and identity (`agent.*`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Name stamped into `@metadata.beat`
    #[serde(default = "default_name")]
    pub name: String,

    /// Events per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum time a partial batch waits before it is sent
    #[serde(default = "default_flush_interval", with = "duration_serde")]
    pub flush_interval: Duration,

    /// Tags added to every event's metadata
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        AgentSettings {
            name: default_name(),
            batch_size: default_batch_size(),
            flush_interval: default_flush_interval(),
            tags: Vec::new(),
        }
    }
}

/// Retry policy for failed batches (`backoff.*`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffSettings {
    /// Delay before the first re-submission
    #[serde(default = "default_backoff_init", with = "duration_serde")]
    pub init: Duration,

    /// Upper bound for the delay
    #[serde(default = "default_backoff_max", with = "duration_serde")]
    pub max: Duration,

    /// Re-submissions per batch before it is dropped
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        BackoffSettings {
            init: default_backoff_init(),
            max: default_backoff_max(),
            max_retries: default_max_retries(),
        }
    }
}

impl BackoffSettings {
    /// Delay before re-submission number `attempt` (1-based)
    ///
    /// Doubles from `init` and is capped at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        std::cmp::min(self.init.saturating_mul(factor), self.max)
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging settings (`logging.*`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default)]
    pub format: LogFormat,
}

/// Output section (`output.*`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSettings {
    pub redis: RedisOutputConfig,
}

fn default_name() -> String {
    "shipline".to_string()
}

fn default_batch_size() -> usize {
    512
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_backoff_init() -> Duration {
    Duration::from_secs(1)
}

fn default_backoff_max() -> Duration {
    Duration::from_secs(60)
}

fn default_max_retries() -> u32 {
    3
}

impl AgentConfig {
    /// Loads `.env`, the config file and `SHIPLINE__*` overrides
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or the result is
    /// invalid.
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let path = env::var("SHIPLINE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.into());

        let config = Config::builder()
            .add_source(File::from(Path::new(&path)).required(false))
            .add_source(environment())
            .build()
            .with_context(|| format!("Failed to read configuration from {}", path))?;

        Self::finish(config)
    }

    /// Parses a TOML document, still honoring `SHIPLINE__*` overrides
    pub fn from_toml(toml: &str) -> anyhow::Result<Self> {
        let config = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .add_source(environment())
            .build()
            .context("Failed to parse configuration")?;

        Self::finish(config)
    }

    fn finish(config: Config) -> anyhow::Result<Self> {
        let config: AgentConfig = config
            .try_deserialize()
            .context("Invalid configuration")?;
        config.check()?;
        Ok(config)
    }

    /// Validates the agent settings and the Redis output
    pub fn check(&self) -> anyhow::Result<()> {
        if self.agent.batch_size == 0 {
            bail!("agent.batch_size must be positive");
        }
        if self.agent.flush_interval.is_zero() {
            bail!("agent.flush_interval must be positive");
        }
        if self.backoff.init > self.backoff.max {
            bail!("backoff.init must not exceed backoff.max");
        }
        self.output
            .redis
            .check()
            .context("Invalid output.redis configuration")?;
        Ok(())
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("output.redis.hosts")
        .with_list_parse_key("agent.tags")
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipline_output::output::DataType;

    const MINIMAL: &str = r#"
        [output.redis]
        hosts = ["localhost:6379"]
        key = "shipline"
    "#;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::from_toml(MINIMAL).unwrap();

        assert_eq!(config.agent.name, "shipline");
        assert_eq!(config.agent.batch_size, 512);
        assert_eq!(config.agent.flush_interval, Duration::from_secs(1));
        assert_eq!(config.backoff.init, Duration::from_secs(1));
        assert_eq!(config.backoff.max, Duration::from_secs(60));
        assert_eq!(config.backoff.max_retries, 3);
        assert_eq!(config.logging.format, LogFormat::Text);
        assert_eq!(config.output.redis.datatype, DataType::List);
    }

    #[test]
    fn test_full_document() {
        let config = AgentConfig::from_toml(
            r#"
            [agent]
            name = "edge"
            batch_size = 10
            flush_interval = "250ms"
            tags = ["a", "b"]

            [backoff]
            init = "2s"
            max = "1m"
            max_retries = 5

            [logging]
            format = "json"

            [output.redis]
            hosts = ["rediss://cache:6380"]
            key = "events"
            datatype = "channel"
            timeout = 3

            [output.redis.ssl]
            verification_mode = "none"
            "#,
        )
        .unwrap();

        assert_eq!(config.agent.name, "edge");
        assert_eq!(config.agent.flush_interval, Duration::from_millis(250));
        assert_eq!(config.agent.tags, vec!["a", "b"]);
        assert_eq!(config.backoff.max, Duration::from_secs(60));
        assert_eq!(config.backoff.max_retries, 5);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.output.redis.datatype, DataType::Channel);
        assert_eq!(config.output.redis.timeout, Duration::from_secs(3));
        assert!(config.output.redis.tls.is_some());
    }

    #[test]
    fn test_missing_output_is_rejected() {
        assert!(AgentConfig::from_toml("[agent]\nname = \"x\"\n").is_err());
    }

    #[test]
    fn test_invalid_output_is_rejected() {
        let err = AgentConfig::from_toml(
            r#"
            [output.redis]
            hosts = []
            key = "k"
            "#,
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("output.redis"));
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        let toml = format!("[agent]\nbatch_size = 0\n{}", MINIMAL);
        assert!(AgentConfig::from_toml(&toml).is_err());
    }

    #[test]
    fn test_backoff_doubles_until_capped() {
        let backoff = BackoffSettings {
            init: Duration::from_secs(1),
            max: Duration::from_secs(10),
            max_retries: 3,
        };

        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::from_secs(2));
        assert_eq!(backoff.delay(4), Duration::from_secs(8));
        assert_eq!(backoff.delay(5), Duration::from_secs(10));
        assert_eq!(backoff.delay(40), Duration::from_secs(10));
    }
}
