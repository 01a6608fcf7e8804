//! Pool configuration: options, named sections, env and JSON loading.
//!
//! Section resolution walks `pools` in order. Unnamed sections apply to
//! every pool; a section named after the pool applies and ends the walk.
//!
//! ```json
//! {"pools":[{"min_threads":8},{"name":"io","max_threads":64,"idle_shutdown_ms":-1}]}
//! ```

use super::{
    errors::ConfigError,
    model::WaitTimeout,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;


pub const DEFAULT_MAX_THREADS: usize = 32_768;
pub const DEFAULT_IDLE_SHUTDOWN_MS: i64 = 120_000;

/// Shortest idle shutdown accepted from configuration.
const MIN_IDLE_SHUTDOWN_MS: i64 = 1_000;


#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    pub min_threads: usize,
    pub max_threads: usize,
    /// `-1` disables idle shutdown.
    pub idle_shutdown_ms: i64,
    pub read_only: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            min_threads: num_cpus::get(),
            max_threads: DEFAULT_MAX_THREADS,
            idle_shutdown_ms: DEFAULT_IDLE_SHUTDOWN_MS,
            read_only: false,
        }
    }
}

impl PoolOptions {
    /// The configured idle timeout, or `None` when the value is out of range
    /// and should be ignored.
    pub fn idle_timeout(&self) -> Option<WaitTimeout> {
        idle_timeout_from_millis(self.idle_shutdown_ms)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads `<PREFIX>_MIN_THREADS`, `<PREFIX>_MAX_THREADS`,
    /// `<PREFIX>_IDLE_SHUTDOWN` and `<PREFIX>_READ_ONLY`.
    pub fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        let mut options = Self::default();

        let key = format!("{prefix}_MIN_THREADS");
        if let Some(raw) = env_opt(&key) {
            options.min_threads = parse_count(&key, raw)?;
        }

        let key = format!("{prefix}_MAX_THREADS");
        if let Some(raw) = env_opt(&key) {
            options.max_threads = parse_count(&key, raw)?;
        }

        let key = format!("{prefix}_IDLE_SHUTDOWN");
        if let Some(raw) = env_opt(&key) {
            options.idle_shutdown_ms = parse_idle_shutdown(&raw).map_err(|error| ConfigError::Parse {
                key: key.clone(),
                value: raw,
                error,
            })?;
        }

        options.read_only = env_bool(&format!("{prefix}_READ_ONLY"), options.read_only);

        if options.max_threads < options.min_threads {
            return Err(ConfigError::Invalid {
                key: format!("{prefix}_MAX_THREADS"),
                message: format!(
                    "maximum ({}) is below minimum ({})",
                    options.max_threads, options.min_threads
                ),
            });
        }

        Ok(options)
    }
}


/// One entry of a [`PoolConfiguration`]. Missing fields leave the current
/// value untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    pub name: Option<String>,
    pub min_threads: Option<usize>,
    pub max_threads: Option<usize>,
    pub idle_shutdown_ms: Option<i64>,
    pub read_only: Option<bool>,
}

impl PoolSection {
    fn applies_to(&self, pool_name: &str) -> bool {
        match self.name.as_deref() {
            None | Some("") => true,
            Some(name) => name == pool_name,
        }
    }

    fn overlay(&self, options: &mut PoolOptions) {
        if let Some(min) = self.min_threads {
            options.min_threads = min;
        }
        if let Some(max) = self.max_threads {
            options.max_threads = max;
        }
        if let Some(ms) = self.idle_shutdown_ms {
            if idle_timeout_from_millis(ms).is_some() {
                options.idle_shutdown_ms = ms;
            }
        }
        if let Some(read_only) = self.read_only {
            options.read_only = read_only;
        }
        if options.max_threads < options.min_threads {
            options.max_threads = options.min_threads;
        }
    }
}


#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfiguration {
    pub pools: Vec<PoolSection>,
}

impl PoolConfiguration {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Options for `pool_name`, layered on top of `base`.
    pub fn resolve(&self, pool_name: &str, base: &PoolOptions) -> PoolOptions {
        let mut options = base.clone();
        for section in self.pools.iter().filter(|s| s.applies_to(pool_name)) {
            section.overlay(&mut options);
            if section.name.as_deref() == Some(pool_name) {
                break;
            }
        }
        options
    }
}


fn idle_timeout_from_millis(ms: i64) -> Option<WaitTimeout> {
    match ms {
        -1 => Some(WaitTimeout::Infinite),
        ms if ms >= MIN_IDLE_SHUTDOWN_MS => Some(WaitTimeout::After(Duration::from_millis(ms as u64))),
        _ => None,
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn parse_count(key: &str, raw: String) -> Result<usize, ConfigError> {
    raw.trim().parse::<usize>().map_err(|e| ConfigError::Parse {
        key: key.to_string(),
        value: raw.clone(),
        error: e.to_string(),
    })
}

/// Parses an idle shutdown value into milliseconds.
///
/// Accepts `off`, `infinite` or `-1` for no shutdown, bare milliseconds,
/// or a number with an `ms`, `s`, `m` or `h` suffix.
pub fn parse_idle_shutdown(raw: &str) -> Result<i64, String> {
    let s = raw.trim().to_lowercase();
    if s == "off" || s == "infinite" || s == "-1" {
        return Ok(-1);
    }

    let (num, factor) = if let Some(n) = s.strip_suffix("ms") {
        (n, 1)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1_000)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60_000)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 3_600_000)
    } else {
        (s.as_str(), 1)
    };

    let value: i64 = num
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration: {raw}"))?;
    if value < 0 {
        return Err(format!("negative duration: {raw}"));
    }
    value
        .checked_mul(factor)
        .ok_or_else(|| format!("duration out of range: {raw}"))
}
