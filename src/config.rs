//! Configuration types for retrying-http

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-attempt transfer settings (buffer sizes, client identity, timeouts)
///
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Initial capacity of the in-memory response buffer (default: 1 MB, 256 KB on mobile targets)
    #[serde(default = "default_response_size")]
    pub default_response_size: usize,

    /// Largest in-memory response accepted before failing with
    /// `ResponseTooLarge` (default: 4 MB, 1 MB on mobile targets)
    #[serde(default = "default_maximum_response_size")]
    pub maximum_response_size: usize,

    /// User-Agent stamped on every request built by [`crate::HttpRequest::get`]
    /// and by the shared client
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// TCP/TLS connect timeout (default: 30 seconds)
    #[serde(default = "default_connect_timeout", with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Whole-request timeout (None = no limit)
    #[serde(default, with = "optional_duration_serde")]
    pub request_timeout: Option<Duration>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            default_response_size: default_response_size(),
            maximum_response_size: default_maximum_response_size(),
            user_agent: default_user_agent(),
            connect_timeout: default_connect_timeout(),
            request_timeout: None,
        }
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum-delay ceilings, indexed by retry count and saturating at the
    /// last entry (default: 1s, 1m, 1h, 6h)
    #[serde(default = "default_retry_schedule", with = "duration_vec_serde")]
    pub schedule: Vec<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            schedule: default_retry_schedule(),
        }
    }
}

/// Queue widths of the [`crate::Dispatcher`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Maximum number of concurrent network transfers system-wide (default: 4)
    #[serde(default = "default_transfer_width")]
    pub transfer_width: usize,

    /// Width of the compute queue (None = available parallelism)
    #[serde(default)]
    pub compute_width: Option<usize>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            transfer_width: default_transfer_width(),
            compute_width: None,
        }
    }
}

/// Settings for the polling reachability monitor
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReachabilityConfig {
    /// How often a watched host is re-resolved (default: 5 seconds)
    #[serde(default = "default_poll_interval", with = "duration_serde")]
    pub poll_interval: Duration,
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
        }
    }
}

/// Main configuration
///
/// Fields are organized into logical sub-configs:
/// - [`transfer`](TransferConfig) — buffer sizes, user agent, timeouts
/// - [`retry`](RetryConfig) — backoff schedule
/// - [`dispatcher`](DispatcherConfig) — queue widths
/// - [`reachability`](ReachabilityConfig) — reachability polling
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Per-attempt transfer settings
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Backoff schedule
    #[serde(default)]
    pub retry: RetryConfig,

    /// Queue widths
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Reachability polling
    #[serde(default)]
    pub reachability: ReachabilityConfig,
}

impl Config {
    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the runtime cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.retry.schedule.is_empty() {
            return Err(Error::config(
                "backoff schedule must contain at least one ceiling",
                "retry.schedule",
            ));
        }
        if self.retry.schedule.windows(2).any(|w| w[1] < w[0]) {
            return Err(Error::config(
                "backoff ceilings must be non-decreasing",
                "retry.schedule",
            ));
        }
        if self.dispatcher.transfer_width == 0 {
            return Err(Error::config(
                "transfer queue width must be at least 1",
                "dispatcher.transfer_width",
            ));
        }
        if self.dispatcher.compute_width == Some(0) {
            return Err(Error::config(
                "compute queue width must be at least 1",
                "dispatcher.compute_width",
            ));
        }
        if self.transfer.maximum_response_size < self.transfer.default_response_size {
            return Err(Error::config(
                "maximum response size is smaller than the default size",
                "transfer.maximum_response_size",
            ));
        }
        if self.reachability.poll_interval.is_zero() {
            return Err(Error::config(
                "reachability poll interval must be non-zero",
                "reachability.poll_interval",
            ));
        }
        Ok(())
    }

    /// Build the HTTP client shared by every request task
    pub fn http_client(&self) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .user_agent(self.transfer.user_agent.clone())
            .connect_timeout(self.transfer.connect_timeout);
        if let Some(timeout) = self.transfer.request_timeout {
            builder = builder.timeout(timeout);
        }
        Ok(builder.build()?)
    }
}

#[cfg(not(any(target_os = "ios", target_os = "android")))]
fn default_response_size() -> usize {
    1024 * 1024
}

#[cfg(any(target_os = "ios", target_os = "android"))]
fn default_response_size() -> usize {
    256 * 1024
}

#[cfg(not(any(target_os = "ios", target_os = "android")))]
fn default_maximum_response_size() -> usize {
    4 * 1024 * 1024
}

#[cfg(any(target_os = "ios", target_os = "android"))]
fn default_maximum_response_size() -> usize {
    1024 * 1024
}

fn default_user_agent() -> String {
    concat!("retrying-http/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_retry_schedule() -> Vec<Duration> {
    vec![
        Duration::from_secs(1),
        Duration::from_secs(60),
        Duration::from_secs(60 * 60),
        Duration::from_secs(6 * 60 * 60),
    ]
}

fn default_transfer_width() -> usize {
    4
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

// Duration serialization helper
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Optional Duration serialization helper
mod optional_duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}

// Duration list serialization helper (seconds)
mod duration_vec_serde {
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(durations: &[Duration], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(durations.len()))?;
        for d in durations {
            seq.serialize_element(&d.as_secs())?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Vec::<u64>::deserialize(deserializer)?;
        Ok(secs.into_iter().map(Duration::from_secs).collect())
    }
}
