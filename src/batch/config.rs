//! Batch configuration.

use super::cancel::CancelPolicy;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchConfig {
    /// Maximum operations in flight at once. Clamped to at least 1.
    pub concurrency_limit: usize,
    /// Per-operation deadline; an operation still running after it fails with `timed_out`.
    pub operation_timeout_ms: Option<u64>,
    /// Cancel the batch after this many failures.
    pub max_failures: Option<usize>,
    /// Abort in-flight operations on `cancel()`.
    pub abort_in_flight: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 5,
            operation_timeout_ms: None,
            max_failures: None,
            abort_in_flight: false,
        }
    }
}

impl BatchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_max_failures(mut self, n: usize) -> Self {
        self.max_failures = Some(n);
        self
    }

    pub fn with_abort_in_flight(mut self, abort: bool) -> Self {
        self.abort_in_flight = abort;
        self
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_ms.map(Duration::from_millis)
    }

    /// The permit count actually used by the pool.
    pub fn effective_limit(&self) -> usize {
        self.concurrency_limit.max(1)
    }

    pub fn cancel_policy(&self) -> CancelPolicy {
        CancelPolicy {
            max_failures: self.max_failures,
            abort_in_flight: self.abort_in_flight,
        }
    }

    /// Defaults overridden by environment variables:
    /// - `UPLOAD_BATCH_CONCURRENCY`
    /// - `UPLOAD_BATCH_OPERATION_TIMEOUT_MS`
    /// - `UPLOAD_BATCH_MAX_FAILURES`
    /// - `UPLOAD_BATCH_ABORT_IN_FLIGHT` (`1`/`true`)
    pub fn from_env() -> Self {
        Self::default().merge_env()
    }

    /// Apply environment overrides on top of `self`. Unparsable values are ignored.
    pub fn merge_env(mut self) -> Self {
        if let Some(v) = env_parse::<usize>("UPLOAD_BATCH_CONCURRENCY").filter(|v| *v > 0) {
            self.concurrency_limit = v;
        }
        if let Some(v) = env_parse::<u64>("UPLOAD_BATCH_OPERATION_TIMEOUT_MS").filter(|v| *v > 0) {
            self.operation_timeout_ms = Some(v);
        }
        if let Some(v) = env_parse::<usize>("UPLOAD_BATCH_MAX_FAILURES").filter(|v| *v > 0) {
            self.max_failures = Some(v);
        }
        if let Ok(v) = std::env::var("UPLOAD_BATCH_ABORT_IN_FLIGHT") {
            self.abort_in_flight = matches!(v.trim(), "1" | "true" | "yes");
        }
        self
    }

    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let cfg: BatchConfig = serde_yaml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency_limit == 0 {
            return Err(Error::configuration_with_context(
                "concurrency limit must be at least 1",
                ErrorContext::new()
                    .with_field_path("concurrency_limit")
                    .with_source("batch_config"),
            ));
        }
        if self.max_failures == Some(0) {
            return Err(Error::configuration_with_context(
                "max_failures of 0 would cancel every batch before it starts",
                ErrorContext::new()
                    .with_field_path("max_failures")
                    .with_source("batch_config"),
            ));
        }
        if self.operation_timeout_ms == Some(0) {
            return Err(Error::configuration_with_context(
                "operation timeout must be positive",
                ErrorContext::new()
                    .with_field_path("operation_timeout_ms")
                    .with_source("batch_config"),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
}
