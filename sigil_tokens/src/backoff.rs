//! Error backoff handling

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for how to manage backoff when an error is encountered
///
/// The pause after the `n`th consecutive failure is `min(max_delay, base_delay * n)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorBackoffConfig {
    #[serde(with = "millis")]
    base_delay: Duration,
    #[serde(with = "millis")]
    max_delay: Duration,
}

impl Default for ErrorBackoffConfig {
    /// Default backoff configuration
    ///
    /// Uses a base delay of 3 seconds, growing linearly with each failure up
    /// to 30 seconds.
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ErrorBackoffConfig {
    /// Constructs a new backoff configuration
    ///
    /// When encountering an error for the first time, the backoff will be `base_delay`.
    /// Each further consecutive error adds another `base_delay`, with a cap of
    /// `max_delay`.
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// The delay after a first failure
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// The ceiling on any delay
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    fn delay_for(&self, failures: u32) -> Duration {
        self.base_delay
            .checked_mul(failures)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Utility trait for extending types with a backoff handler
pub trait WithBackoff {
    /// The output of providing backoff
    type Output;

    /// Applies backoff to the current value
    fn with_backoff(self, handler: &mut ErrorBackoffHandler) -> Self::Output;
}

impl<T, E> WithBackoff for Result<T, E> {
    type Output = Result<T, (E, Duration)>;
    fn with_backoff(self, handler: &mut ErrorBackoffHandler) -> Self::Output {
        match self {
            Ok(ok) => {
                handler.success();
                Ok(ok)
            }
            Err(err) => Err((err, handler.error())),
        }
    }
}

/// A stateful handler that manages error backoff state
#[derive(Debug, Default)]
pub struct ErrorBackoffHandler {
    config: ErrorBackoffConfig,
    failures: u32,
}

impl ErrorBackoffHandler {
    /// Constructs a new handler from an [`ErrorBackoffConfig`].
    pub fn new(config: ErrorBackoffConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    /// Reports a success
    ///
    /// This resets the failure count.
    pub fn success(&mut self) {
        self.failures = 0;
    }

    /// Reports a failure and returns the expected backoff delay
    pub fn error(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.config.delay_for(self.failures)
    }

    /// The number of consecutive failures since the last success
    #[must_use]
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// The delay that was last handed out, or zero after a success
    #[must_use]
    pub fn current_delay(&self) -> Duration {
        self.config.delay_for(self.failures)
    }
}

impl From<ErrorBackoffConfig> for ErrorBackoffHandler {
    fn from(config: ErrorBackoffConfig) -> Self {
        Self::new(config)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
