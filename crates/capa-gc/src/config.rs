//! Garbage collector configuration
//!
//! One [`GcConfig`] is shared by every cluster the controller reconciles.
//! Every field has a default so an empty document is a valid configuration;
//! durations are written as (possibly fractional) seconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::discovery::DiscoveryStrategy;
use crate::retry::RetryConfig;
use crate::{Error, Result};

/// Tunables for discovery, deletion and the reconcile loop
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GcConfig {
    /// Strategy used when the controller starts; can be flipped at runtime
    /// through the controller's strategy selector
    pub discovery_strategy: DiscoveryStrategy,
    /// Backoff for throttled list calls
    pub discovery_retry: RetryConfig,
    /// Backoff for detach and delete calls
    pub delete_retry: RetryConfig,
    /// Maximum steps in flight within one batch
    pub delete_concurrency: usize,
    /// Reconcile attempts before a run with leftovers is reported blocked
    pub max_reconcile_attempts: u32,
    /// Inventory age after which event-driven discovery falls back to polling
    #[serde(with = "duration_secs")]
    pub event_staleness_threshold: Duration,
    /// How long deletion tombstones are kept to discard late creation events
    #[serde(with = "duration_secs")]
    pub tombstone_retention: Duration,
    /// Items requested per list call
    pub page_size: u32,
    /// Account the credentials belong to; resources whose ARN names another
    /// account are never touched
    pub account_id: Option<String>,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            discovery_strategy: DiscoveryStrategy::Polling,
            discovery_retry: RetryConfig::default(),
            delete_retry: RetryConfig {
                max_attempts: 4,
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(20),
                backoff_multiplier: 2.0,
                max_elapsed: Some(Duration::from_secs(60)),
            },
            delete_concurrency: 4,
            max_reconcile_attempts: 10,
            event_staleness_threshold: Duration::from_secs(120),
            tombstone_retention: Duration::from_secs(3600),
            page_size: 100,
            account_id: None,
        }
    }
}

impl GcConfig {
    /// Parse a JSON document and validate it
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| Error::validation(format!("invalid GC config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall every run
    pub fn validate(&self) -> Result<()> {
        if self.delete_concurrency == 0 {
            return Err(Error::validation_for_field(
                crate::error::UNKNOWN_CONTEXT,
                "deleteConcurrency",
                "must be at least 1",
            ));
        }
        if self.page_size == 0 {
            return Err(Error::validation_for_field(
                crate::error::UNKNOWN_CONTEXT,
                "pageSize",
                "must be at least 1",
            ));
        }
        if self.max_reconcile_attempts == 0 {
            return Err(Error::validation_for_field(
                crate::error::UNKNOWN_CONTEXT,
                "maxReconcileAttempts",
                "must be at least 1",
            ));
        }
        for (field, retry) in [
            ("discoveryRetry", &self.discovery_retry),
            ("deleteRetry", &self.delete_retry),
        ] {
            if retry.backoff_multiplier < 1.0 {
                return Err(Error::validation_for_field(
                    crate::error::UNKNOWN_CONTEXT,
                    format!("{field}.backoffMultiplier"),
                    "must be at least 1.0",
                ));
            }
        }
        Ok(())
    }
}

/// Serde adapter writing a [`Duration`] as seconds
pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize as fractional seconds
    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(value.as_secs_f64())
    }

    /// Deserialize from non-negative seconds
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for an optional [`Duration`] written as seconds
pub mod opt_duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize as fractional seconds or null
    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    /// Deserialize from non-negative seconds or null
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<f64>::deserialize(deserializer)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .transpose()
    }
}
