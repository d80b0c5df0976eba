//! Sync engine configuration.
//!
//! All periods and timeouts deserialize from humantime strings, with
//! defaults suitable for a single reconciler process.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Adoption policy: whether the applier may take ownership of pre-existing
/// objects it did not create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AdoptionPolicy {
    /// Take over any live object, owned or not.
    AdoptAll,
    /// Adopt unowned objects, but refuse objects carrying a different
    /// inventory ID.
    #[default]
    AdoptIfNoInventory,
    /// Only manage objects already stamped with this sync's inventory ID.
    PreventAdoption,
}

/// How validation failures are handled during queue construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ValidationPolicy {
    /// Abort the cycle on any invalid object.
    #[default]
    ExitEarly,
    /// Keep invalid IDs in the inventory but exclude them from this cycle's
    /// mutations.
    SkipInvalid,
}

/// Whether undeclared namespaces of declared objects are created implicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NamespaceStrategy {
    /// Root syncs synthesize missing namespaces with a prevent-deletion
    /// lifecycle annotation.
    #[default]
    Implicit,
    /// Namespaces must be declared; applies into missing namespaces fail.
    Explicit,
}

/// Backoff between retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffConfig {
    /// Fixed delay between retries.
    Fixed {
        /// Delay duration.
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },

    /// Exponential backoff.
    Exponential {
        /// Initial delay.
        #[serde(with = "humantime_serde")]
        initial_delay: Duration,

        /// Maximum delay.
        #[serde(with = "humantime_serde")]
        max_delay: Duration,

        /// Multiplier for each retry (default: 2.0).
        #[serde(default = "default_multiplier")]
        multiplier: f64,
    },

    /// Linear backoff.
    Linear {
        /// Initial delay.
        #[serde(with = "humantime_serde")]
        initial_delay: Duration,

        /// Increment per retry.
        #[serde(with = "humantime_serde")]
        increment: Duration,

        /// Maximum delay.
        #[serde(with = "humantime_serde")]
        max_delay: Duration,
    },
}

const fn default_multiplier() -> f64 {
    2.0
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::Exponential {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Calculate the delay for a given attempt number (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => *delay,
            Self::Exponential {
                initial_delay,
                max_delay,
                multiplier,
            } => {
                #[allow(clippy::cast_possible_wrap)] // attempt count won't exceed i32
                let delay_secs =
                    initial_delay.as_secs_f64() * multiplier.powi(attempt.saturating_sub(1) as i32);
                let delay = Duration::from_secs_f64(delay_secs);
                delay.min(*max_delay)
            }
            Self::Linear {
                initial_delay,
                increment,
                max_delay,
            } => {
                let delay = *initial_delay + *increment * attempt.saturating_sub(1);
                delay.min(*max_delay)
            }
        }
    }
}

/// Configuration for one sync engine instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Period between timed re-evaluations of the source. Zero disables the
    /// timed sync publisher.
    #[serde(default = "default_sync_period")]
    #[serde(with = "humantime_serde")]
    pub sync_period: Duration,

    /// Period between status surfacing updates. Zero disables the publisher.
    #[serde(default = "default_status_update_period")]
    #[serde(with = "humantime_serde")]
    pub status_update_period: Duration,

    /// Period between polls of the namespace-controller resync signal. Zero
    /// disables the publisher.
    #[serde(default = "default_namespace_sync_period")]
    #[serde(with = "humantime_serde")]
    pub namespace_sync_period: Duration,

    /// Backoff between retries after a failed cycle.
    #[serde(default)]
    pub retry_backoff: BackoffConfig,

    /// How long each apply wave waits for its objects to become current.
    #[serde(default = "default_reconcile_timeout")]
    #[serde(with = "humantime_serde")]
    pub reconcile_timeout: Duration,

    /// How long each prune wave waits for its objects to be gone.
    #[serde(default = "default_prune_timeout")]
    #[serde(with = "humantime_serde")]
    pub prune_timeout: Duration,

    /// Poll interval for status waits.
    #[serde(default = "default_status_poll_interval")]
    #[serde(with = "humantime_serde")]
    pub status_poll_interval: Duration,

    /// Maximum concurrent applies or prunes within one wave.
    #[serde(default = "default_apply_parallelism")]
    pub apply_parallelism: usize,

    /// Number of remediator workers.
    #[serde(default = "default_remediator_workers")]
    pub remediator_workers: usize,

    /// Capacity of the remediator work queue.
    #[serde(default = "default_remediator_queue_capacity")]
    pub remediator_queue_capacity: usize,

    /// Corrections of one object within the fight window that count as a
    /// resource fight.
    #[serde(default = "default_fight_threshold")]
    pub fight_threshold: u32,

    /// Sliding window for fight detection.
    #[serde(default = "default_fight_window")]
    #[serde(with = "humantime_serde")]
    pub fight_window: Duration,

    /// Consecutive same-cause cycle failures before the sync reports the
    /// stalled condition.
    #[serde(default = "default_stall_threshold")]
    pub stall_threshold: u32,

    /// Adoption policy for pre-existing live objects.
    #[serde(default)]
    pub adoption_policy: AdoptionPolicy,

    /// Handling of invalid declared objects.
    #[serde(default)]
    pub validation_policy: ValidationPolicy,

    /// Namespace creation strategy.
    #[serde(default)]
    pub namespace_strategy: NamespaceStrategy,

    /// Validate and report without mutating the cluster.
    #[serde(default)]
    pub dry_run: bool,
}

const fn default_sync_period() -> Duration {
    Duration::from_secs(15)
}

const fn default_status_update_period() -> Duration {
    Duration::from_secs(5)
}

const fn default_namespace_sync_period() -> Duration {
    Duration::from_secs(5)
}

const fn default_reconcile_timeout() -> Duration {
    Duration::from_secs(300)
}

const fn default_prune_timeout() -> Duration {
    Duration::from_secs(300)
}

const fn default_status_poll_interval() -> Duration {
    Duration::from_millis(500)
}

const fn default_apply_parallelism() -> usize {
    4
}

const fn default_remediator_workers() -> usize {
    1
}

const fn default_remediator_queue_capacity() -> usize {
    1024
}

const fn default_fight_threshold() -> u32 {
    5
}

const fn default_fight_window() -> Duration {
    Duration::from_secs(3600)
}

const fn default_stall_threshold() -> u32 {
    4
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_period: default_sync_period(),
            status_update_period: default_status_update_period(),
            namespace_sync_period: default_namespace_sync_period(),
            retry_backoff: BackoffConfig::default(),
            reconcile_timeout: default_reconcile_timeout(),
            prune_timeout: default_prune_timeout(),
            status_poll_interval: default_status_poll_interval(),
            apply_parallelism: default_apply_parallelism(),
            remediator_workers: default_remediator_workers(),
            remediator_queue_capacity: default_remediator_queue_capacity(),
            fight_threshold: default_fight_threshold(),
            fight_window: default_fight_window(),
            stall_threshold: default_stall_threshold(),
            adoption_policy: AdoptionPolicy::default(),
            validation_policy: ValidationPolicy::default(),
            namespace_strategy: NamespaceStrategy::default(),
            dry_run: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.sync_period, Duration::from_secs(15));
        assert_eq!(config.adoption_policy, AdoptionPolicy::AdoptIfNoInventory);
        assert_eq!(config.validation_policy, ValidationPolicy::ExitEarly);
        assert_eq!(config.namespace_strategy, NamespaceStrategy::Implicit);
        assert!(!config.dry_run);
    }

    #[test]
    fn test_deserialize_with_humantime() {
        let config: SyncConfig = serde_json::from_value(serde_json::json!({
            "sync_period": "1m",
            "retry_backoff": { "type": "fixed", "delay": "10s" },
            "namespace_strategy": "explicit",
        }))
        .unwrap();
        assert_eq!(config.sync_period, Duration::from_secs(60));
        assert_eq!(
            config.retry_backoff,
            BackoffConfig::Fixed {
                delay: Duration::from_secs(10)
            }
        );
        assert_eq!(config.namespace_strategy, NamespaceStrategy::Explicit);
        // Unset fields fall back to defaults.
        assert_eq!(config.prune_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_exponential_backoff_delays() {
        let backoff = BackoffConfig::Exponential {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
        };
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(4));
        // Capped at the maximum.
        assert_eq!(backoff.delay_for_attempt(10), Duration::from_secs(8));
    }

    #[test]
    fn test_linear_backoff_delays() {
        let backoff = BackoffConfig::Linear {
            initial_delay: Duration::from_secs(2),
            increment: Duration::from_secs(3),
            max_delay: Duration::from_secs(10),
        };
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(5));
        assert_eq!(backoff.delay_for_attempt(4), Duration::from_secs(10));
    }
}
