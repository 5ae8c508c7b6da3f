//! Retry strategies for the crucible orchestration plane.
//!
//! Every retry loop in the core — catalogue CAS, source downloads, external
//! API calls, grading polls — draws its delays from here, so backoff and
//! jitter behave the same everywhere and can be tuned per failure kind.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crucible_types::FailureKind;

/// Strategy type for retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategyType {
    /// No delay between retries - retry immediately
    Immediate,
    /// Exponential backoff: delay doubles each attempt (default)
    #[default]
    Exponential,
    /// Linear backoff: delay increases linearly each attempt
    Linear,
    /// Constant delay: same delay every attempt
    Constant,
}

/// Configuration for a retry strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryStrategyConfig {
    /// Strategy type for calculating delay between retries.
    #[serde(default)]
    pub strategy: RetryStrategyType,
    /// Maximum number of attempts (including the first).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay for backoff calculations.
    #[serde(with = "humantime_serde", default = "default_base_delay")]
    pub base_delay: Duration,
    /// Maximum delay cap for backoff.
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,
    /// Jitter factor (0.0 = none, 0.5 = delay * [0.5, 1.5], 1.0 = full jitter
    /// in [0, 2 * delay]).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryStrategyConfig {
    fn default() -> Self {
        Self {
            strategy: RetryStrategyType::Exponential,
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: default_jitter(),
        }
    }
}

fn default_max_attempts() -> u32 {
    6
}

fn default_base_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_jitter() -> f64 {
    0.5
}

impl RetryStrategyConfig {
    /// Catalogue compare-and-set conflicts: 8 quick attempts, jittered.
    pub fn catalogue_cas() -> Self {
        Self {
            strategy: RetryStrategyType::Exponential,
            max_attempts: 8,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
            jitter: 0.5,
        }
    }

    /// Source downloads: 5 attempts, exponential from 2 s.
    pub fn download() -> Self {
        Self {
            strategy: RetryStrategyType::Exponential,
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            jitter: 0.5,
        }
    }

    /// Competition API transport errors: full jitter between 1 s and 60 s,
    /// capped at 10 attempts.
    pub fn external_api() -> Self {
        Self {
            strategy: RetryStrategyType::Exponential,
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 1.0,
        }
    }
}

/// Per-failure-kind retry configuration. Kinds without an override use the
/// caller's default config; kinds that are never retried (validation,
/// terminal) have no entry at all.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerKindConfig {
    /// Transient infrastructure failures (KV unreachable, network blip).
    #[serde(default)]
    pub transient: Option<RetryStrategyConfig>,
    /// Resource exhaustion (scratch full, persistent high-water).
    #[serde(default)]
    pub exhaustion: Option<RetryStrategyConfig>,
    /// External API transport failures (5xx, connect errors).
    #[serde(default)]
    pub external_api: Option<RetryStrategyConfig>,
}

/// Get the retry configuration for a failure kind, or None for kinds that
/// must never be retried.
pub fn config_for_kind(
    default_config: &RetryStrategyConfig,
    per_kind: &PerKindConfig,
    kind: FailureKind,
) -> Option<RetryStrategyConfig> {
    let overridden = match kind {
        FailureKind::Transient => per_kind.transient.as_ref(),
        FailureKind::Exhaustion => per_kind.exhaustion.as_ref(),
        FailureKind::ExternalApi => per_kind.external_api.as_ref(),
        FailureKind::Validation | FailureKind::Terminal => return None,
    };
    Some(overridden.cloned().unwrap_or_else(|| default_config.clone()))
}

/// Calculate the delay before retry attempt `attempt` (1-based).
pub fn calculate_delay(config: &RetryStrategyConfig, attempt: u32) -> Duration {
    let delay = match config.strategy {
        RetryStrategyType::Immediate => Duration::ZERO,
        RetryStrategyType::Exponential => {
            let pow = attempt.saturating_sub(1).min(16);
            config.base_delay.saturating_mul(2_u32.saturating_pow(pow))
        }
        RetryStrategyType::Linear => config.base_delay.saturating_mul(attempt),
        RetryStrategyType::Constant => config.base_delay,
    };

    let capped = delay.min(config.max_delay);

    if config.jitter > 0.0 {
        apply_jitter(capped, config.jitter)
    } else {
        capped
    }
}

/// Grading-poll cadence: first poll after 2 s, doubling to a 60 s cap.
pub fn poll_delay(attempt: u32) -> Duration {
    let base = Duration::from_secs(2);
    let pow = attempt.saturating_sub(1).min(16);
    base.saturating_mul(2_u32.saturating_pow(pow))
        .min(Duration::from_secs(60))
}

/// Apply jitter to a delay value.
/// Jitter factor of 0.5 means delay * (0.5 to 1.5).
fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    let jitter_range = 2.0 * jitter;
    let random_factor = 1.0 - jitter + (rand::random::<f64>() * jitter_range);
    let millis = (delay.as_millis() as f64 * random_factor).round() as u64;
    Duration::from_millis(millis)
}
