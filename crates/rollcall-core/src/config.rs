use crate::error::{Result, RollcallError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Length of the dlib face encodings the upstream detector produces.
pub const DEFAULT_DIMENSION: usize = 128;
pub const DEFAULT_TOLERANCE: f32 = 0.4;
pub const DEFAULT_MAX_REFERENCES: usize = 5;

/// Core configuration, supplied at construction time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum Euclidean distance at which a probe matches a reference vector.
    pub tolerance: f32,
    /// Reference vectors kept per identity; the oldest is evicted beyond this.
    pub max_references: usize,
    /// Fixed vector length. `None` lets the first enrollment decide.
    pub dimension: Option<usize>,
    pub retry: RetryPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
            max_references: DEFAULT_MAX_REFERENCES,
            dimension: Some(DEFAULT_DIMENSION),
            retry: RetryPolicy::default(),
        }
    }
}

impl Config {
    /// Reject settings the core cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if !self.tolerance.is_finite() || self.tolerance <= 0.0 {
            return Err(RollcallError::InvalidInput(format!(
                "tolerance must be a positive number, got {}",
                self.tolerance
            )));
        }
        if self.max_references == 0 {
            return Err(RollcallError::InvalidInput(
                "max_references must be at least 1".into(),
            ));
        }
        if self.dimension == Some(0) {
            return Err(RollcallError::InvalidInput(
                "dimension must be at least 1".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(RollcallError::InvalidInput(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Bounded retry for transient persistence failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles after each failure.
    pub base_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 50,
        }
    }
}

impl RetryPolicy {
    /// Sleep before attempt `attempt` (1-based; attempt 1 never sleeps).
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let shift = (attempt - 2).min(16);
        Duration::from_millis(self.base_backoff_ms.saturating_mul(1 << shift))
    }
}
