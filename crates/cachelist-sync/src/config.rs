//! Synchronizer configuration.
//!
//! Targets come from the command line. Tunables default from the
//! environment and can be overridden by CLI flags in the binary.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Path segment every synchronized node path must contain.
pub const CACHE_LIST_NAMESPACE: &str = "/arcus/cache_list/";

const ENV_RETRY_DELAY_MS: &str = "CACHELIST_SYNC_RETRY_DELAY_MS";
const ENV_MAX_READ_ATTEMPTS: &str = "CACHELIST_SYNC_MAX_READ_ATTEMPTS";
const ENV_HEARTBEAT_SECS: &str = "CACHELIST_SYNC_HEARTBEAT_SECS";

/// One ensemble to synchronize: `ADDR:PORT/arcus/cache_list/<cluster>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnsembleTarget {
    /// Connect string (`host:port`, possibly comma separated).
    pub address: String,
    /// Absolute node path, without trailing slash.
    pub path: String,
}

impl EnsembleTarget {
    /// Parse and validate a target string.
    ///
    /// The path must live under [`CACHE_LIST_NAMESPACE`] and name a cluster.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let raw = raw.trim();
        let (address, rest) = raw
            .split_once('/')
            .ok_or_else(|| ConfigError::MissingPath(raw.to_string()))?;

        if address.is_empty() {
            return Err(ConfigError::EmptyAddress(raw.to_string()));
        }

        let path = format!("/{}", rest.trim_end_matches('/'));
        // Compare with a trailing slash so "/arcus/cache_list/x" matches.
        let with_slash = format!("{path}/");
        let Some(idx) = with_slash.find(CACHE_LIST_NAMESPACE) else {
            return Err(ConfigError::OutsideNamespace(path));
        };
        if with_slash.len() <= idx + CACHE_LIST_NAMESPACE.len() {
            return Err(ConfigError::MissingClusterName(path));
        }

        Ok(Self {
            address: address.to_string(),
            path,
        })
    }

    /// Absolute path of a child node under this target.
    pub fn child_path(&self, name: &str) -> String {
        format!("{}/{}", self.path, name)
    }
}

impl FromStr for EnsembleTarget {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for EnsembleTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.address, self.path)
    }
}

/// How [`crate::view::EnsembleView::refresh`] retries a read whose path vanished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRetryPolicy {
    /// Pause between attempts.
    pub delay: Duration,
    /// Attempt cap. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReadRetryPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(200),
            max_attempts: None,
        }
    }
}

/// Top-level synchronizer configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Ensembles to keep in sync, in configuration order.
    pub targets: Vec<EnsembleTarget>,
    /// Read retry behaviour for every view.
    pub read_retry: ReadRetryPolicy,
    /// Interval of the liveness log line while idle.
    pub heartbeat_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            read_retry: ReadRetryPolicy::default(),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

impl SyncConfig {
    /// Defaults overridden by `CACHELIST_SYNC_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`SyncConfig::from_env`] with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<u64, _>(&lookup, ENV_RETRY_DELAY_MS)? {
            config.read_retry.delay = Duration::from_millis(ms);
        }
        if let Some(cap) = parse_var::<u32, _>(&lookup, ENV_MAX_READ_ATTEMPTS)? {
            // 0 keeps the unbounded default
            config.read_retry.max_attempts = (cap > 0).then_some(cap);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, ENV_HEARTBEAT_SECS)? {
            config.heartbeat_interval = Duration::from_secs(secs.max(1));
        }

        Ok(config)
    }

    /// Parse and append raw target strings.
    pub fn with_targets<I, S>(mut self, raw: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for target in raw {
            self.targets.push(EnsembleTarget::parse(target.as_ref())?);
        }
        Ok(self)
    }

    /// Check the whole configuration before any session is opened.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.targets.len() < 2 {
            return Err(ConfigError::TooFewTargets(self.targets.len()));
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) if value.trim().is_empty() => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { var, value }),
    }
}
