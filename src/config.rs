//! Runner configuration.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default number of attempts that may run at once.
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 20;
/// Default time between polls of the task store.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Default upper bound on a single wait of the dispatch loop.
pub const DEFAULT_IDLE_WAIT: Duration = Duration::from_millis(10);

/// Settings for the dispatch loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Maximum number of attempts running at the same time.
    pub concurrency_limit: usize,
    /// Minimum time between two polls of the task store.
    #[serde(with = "millis")]
    pub poll_interval: Duration,
    /// Longest the loop waits for a message before re-checking whether to poll.
    #[serde(with = "millis")]
    pub idle_wait: Duration,
    /// Per-attempt time limit. `None` lets handlers run indefinitely.
    #[serde(with = "opt_millis")]
    pub attempt_timeout: Option<Duration>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            idle_wait: DEFAULT_IDLE_WAIT,
            attempt_timeout: None,
        }
    }
}

impl RunnerConfig {
    /// Build config from `DELTATASK_*` environment variables, falling back to defaults.
    ///
    /// - `DELTATASK_CONCURRENCY_LIMIT`
    /// - `DELTATASK_POLL_INTERVAL_MS`
    /// - `DELTATASK_IDLE_WAIT_MS`
    /// - `DELTATASK_ATTEMPT_TIMEOUT_MS` (`0` disables the timeout)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build config from an arbitrary variable source, as [`from_env`](Self::from_env) does.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let opt = |key: &str| lookup(key).filter(|s| !s.is_empty());
        let millis = |key: &str| {
            opt(key)
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
        };

        let defaults = Self::default();
        Self {
            concurrency_limit: opt("DELTATASK_CONCURRENCY_LIMIT")
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.concurrency_limit),
            poll_interval: millis("DELTATASK_POLL_INTERVAL_MS").unwrap_or(defaults.poll_interval),
            idle_wait: millis("DELTATASK_IDLE_WAIT_MS")
                .filter(|d| !d.is_zero())
                .unwrap_or(defaults.idle_wait),
            attempt_timeout: millis("DELTATASK_ATTEMPT_TIMEOUT_MS").filter(|d| !d.is_zero()),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.filter(|ms| *ms > 0).map(Duration::from_millis))
    }
}
