use remixctl_core::config::SafetyConfig;
use std::time::Duration;

/// Exponential backoff for transient remix failures:
/// `delay(attempt) = min(base ^ attempt, max)` seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_secs: f64,
    pub max_secs: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SafetyConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &SafetyConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            base_secs: cfg.retry_backoff_base_secs.max(1.0),
            max_secs: cfg.retry_backoff_max_secs.max(0.0),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Whether retry number `attempt` (1-based) is still allowed.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt >= 1 && attempt <= self.max_retries
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let secs = self.base_secs.powi(attempt.min(i32::MAX as u32) as i32);
        Duration::from_secs_f64(secs.min(self.max_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_secs: 2.0,
            max_secs: 30.0,
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(16));
        assert_eq!(policy.delay_for(5), Duration::from_secs(30));
        assert_eq!(policy.delay_for(60), Duration::from_secs(30));
    }

    #[test]
    fn test_allows() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 2);
        assert!(!policy.allows(0));
        assert!(policy.allows(1));
        assert!(policy.allows(2));
        assert!(!policy.allows(3));
        assert!(!policy.with_max_retries(0).allows(1));
    }
}
