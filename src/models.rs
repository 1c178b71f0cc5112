use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Context attributes scope flag evaluation: the server may resolve the same
/// flag differently for different attribute sets. Fixed for the lifetime of a
/// client and sent as the query string of every request. Ordered so the query
/// string is deterministic.
pub type ContextAttributes = BTreeMap<String, String>;

/// Request attributes are opaque metadata sent as `X-Tonga-<key>` headers for
/// server-side logging only. A `None` value means the header is omitted
/// entirely, never sent as an empty string.
pub type RequestAttributes = BTreeMap<String, Option<String>>;

/// A resolved flag value.
///
/// `Null` means the flag resolved to absent (e.g. the server returned 404).
/// It is cached like any other value so the server is not asked again, which
/// is distinct from a flag that was never resolved at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlagValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
}

impl FlagValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FlagValue::Null)
    }

    /// The deterministic JSON rendering used as the analytics counter key
    /// (`true`, `2`, `"text"`, `null`).
    pub fn to_json_string(&self) -> String {
        serde_json::to_string(self).expect("flag values always serialize")
    }
}

impl From<bool> for FlagValue {
    fn from(value: bool) -> Self {
        FlagValue::Bool(value)
    }
}

impl From<i32> for FlagValue {
    fn from(value: i32) -> Self {
        FlagValue::Number(value.into())
    }
}

impl From<i64> for FlagValue {
    fn from(value: i64) -> Self {
        FlagValue::Number(value.into())
    }
}

impl From<f64> for FlagValue {
    fn from(value: f64) -> Self {
        serde_json::Number::from_f64(value).map_or(FlagValue::Null, FlagValue::Number)
    }
}

impl From<&str> for FlagValue {
    fn from(value: &str) -> Self {
        FlagValue::String(value.to_owned())
    }
}

impl From<String> for FlagValue {
    fn from(value: String) -> Self {
        FlagValue::String(value)
    }
}

impl TryFrom<Value> for FlagValue {
    type Error = anyhow::Error;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(FlagValue::Null),
            Value::Bool(b) => Ok(FlagValue::Bool(b)),
            Value::Number(n) => Ok(FlagValue::Number(n)),
            Value::String(s) => Ok(FlagValue::String(s)),
            Value::Array(_) | Value::Object(_) => {
                bail!("flag values must be JSON scalars or null")
            }
        }
    }
}

impl From<FlagValue> for Value {
    fn from(value: FlagValue) -> Self {
        match value {
            FlagValue::Null => Value::Null,
            FlagValue::Bool(b) => Value::Bool(b),
            FlagValue::Number(n) => Value::Number(n),
            FlagValue::String(s) => Value::String(s),
        }
    }
}

/// Configuration for the behavior of a [`TongaClient`](crate::TongaClient).
#[derive(Debug, Clone)]
pub struct TongaOptions {
    /// Never contact the server; cache misses resolve to the caller-supplied
    /// offline value and analytics are not reported.
    pub offline_mode: bool,
    /// Extra fetch attempts after the first failed one. 404 is never retried.
    pub retries: u32,
    /// Fixed delay between fetch attempts. No exponential backoff, so the
    /// worst-case latency of a `get` stays predictable.
    pub retry_delay: Duration,
    /// Resolve the first cache miss by fetching all flags in one bulk call
    /// instead of one round trip per flag. Happens at most once per client.
    pub pre_fetch: bool,
    /// Interval between analytics reports to the server.
    pub analytics_report_interval: Duration,
    /// How long `close` waits for the analytics task to finish its final
    /// flush before giving up on it.
    pub timeout_on_close: Duration,
}

impl Default for TongaOptions {
    fn default() -> Self {
        Self {
            offline_mode: false,
            retries: 0,
            retry_delay: Duration::from_secs(1),
            pre_fetch: false,
            analytics_report_interval: Duration::from_secs(5),
            timeout_on_close: Duration::from_secs(5),
        }
    }
}
