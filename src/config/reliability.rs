use chrono_machines::{BackoffPolicy, ConstantBackoff, ExponentialBackoff, FibonacciBackoff};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    #[default]
    Exponential,
    Fibonacci,
    Constant,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Enable retry mechanism
    #[serde(default = "RetryConfig::default_enabled")]
    pub enabled: bool,
    /// Maximum number of attempts per upstream, including the first one
    #[serde(default = "RetryConfig::default_max_attempts")]
    pub max_attempts: u32,
    /// Initial backoff duration (milliseconds)
    #[serde(default = "RetryConfig::default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Maximum backoff duration (seconds)
    #[serde(default = "RetryConfig::default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    #[serde(default)]
    pub backoff_strategy: BackoffStrategy,
    /// Share of each delay that is randomized (0.0 = none, 1.0 = full jitter)
    #[serde(default = "RetryConfig::default_jitter_factor")]
    pub jitter_factor: f64,
}

impl RetryConfig {
    fn default_enabled() -> bool {
        true
    }

    fn default_max_attempts() -> u32 {
        3
    }

    fn default_initial_backoff_ms() -> u64 {
        100
    }

    fn default_max_backoff_secs() -> u64 {
        2
    }

    fn default_jitter_factor() -> f64 {
        1.0
    }

    /// Attempts per upstream; 1 when retries are disabled.
    pub fn attempts(&self) -> u8 {
        if self.enabled {
            u8::try_from(self.max_attempts.max(1)).unwrap_or(u8::MAX)
        } else {
            1
        }
    }

    /// Backoff schedule between attempts against a single upstream.
    pub fn policy(&self) -> BackoffPolicy {
        let max_delay_ms = self.max_backoff_secs.saturating_mul(1000);
        let jitter = self.jitter_factor.clamp(0.0, 1.0);
        let max_attempts = self.attempts();

        match self.backoff_strategy {
            BackoffStrategy::Exponential => ExponentialBackoff::new()
                .base_delay_ms(self.initial_backoff_ms)
                .max_delay_ms(max_delay_ms)
                .max_attempts(max_attempts)
                .jitter_factor(jitter)
                .into(),
            BackoffStrategy::Fibonacci => FibonacciBackoff::new()
                .base_delay_ms(self.initial_backoff_ms)
                .max_delay_ms(max_delay_ms)
                .max_attempts(max_attempts)
                .jitter_factor(jitter)
                .into(),
            BackoffStrategy::Constant => ConstantBackoff::new()
                .delay_ms(self.initial_backoff_ms)
                .max_attempts(max_attempts)
                .jitter_factor(jitter)
                .into(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            max_attempts: Self::default_max_attempts(),
            initial_backoff_ms: Self::default_initial_backoff_ms(),
            max_backoff_secs: Self::default_max_backoff_secs(),
            backoff_strategy: BackoffStrategy::default(),
            jitter_factor: Self::default_jitter_factor(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReliabilityConfig {
    #[serde(default)]
    pub retry: RetryConfig,
}
