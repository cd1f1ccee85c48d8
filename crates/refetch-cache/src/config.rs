use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{de, Deserialize, Deserializer};
use tracing::level_filters::LevelFilter;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for the cache.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "refetch".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Options that control how a single key is fetched, retried and considered stale.
///
/// The [`CacheConfig::defaults`] apply to [`QueryCache::request`](crate::QueryCache::request),
/// and can be overridden per request via [`QueryCache::request_with`](crate::QueryCache::request_with).
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct RequestOptions {
    /// Time after which a successfully fetched value is considered stale.
    ///
    /// A stale value is still served, but the next access triggers a background refetch.
    #[serde(with = "humantime_serde")]
    pub stale_time: Duration,

    /// Number of retries after a failed fetch, per generation.
    pub retry: u32,

    /// Base delay before the first retry. It doubles for every following retry.
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,

    /// Upper bound for the exponential retry delay.
    #[serde(with = "humantime_serde")]
    pub max_retry_delay: Duration,

    /// Signal cancellation to an in-flight fetch once a newer fetch for the same key supersedes it.
    pub cancel_on_supersede: bool,

    /// Maximum duration of a single fetch attempt. An attempt running longer fails with
    /// [`FetchError::Timeout`](crate::FetchError::Timeout).
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            stale_time: Duration::ZERO,
            retry: 3,
            retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(30),
            cancel_on_supersede: true,
            timeout: None,
        }
    }
}

/// Configuration of a single [`QueryCache`](crate::QueryCache) instance.
#[derive(Debug, Clone, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache identifier used for metric tags and logs.
    pub name: String,

    /// Grace period after the last subscriber detached before an entry is evicted.
    ///
    /// This keeps entries around when consumers quickly detach and re-attach.
    #[serde(with = "humantime_serde")]
    pub gc_time: Duration,

    /// Request options used when none are given explicitly.
    pub defaults: RequestOptions,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "default".into(),
            gc_time: Duration::from_secs(5 * 60),
            defaults: RequestOptions::default(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration of the logging system.
    pub logging: Logging,
    /// Configuration of the statsd metrics.
    pub metrics: Metrics,
    /// Configuration of the cache itself.
    pub cache: CacheConfig,
}

impl Config {
    /// Loads the configuration from a YAML file, or returns the defaults without a path.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    pub fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl<'de> de::Visitor<'de> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
