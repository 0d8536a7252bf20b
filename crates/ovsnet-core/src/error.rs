//! Error types shared across the ovsnet crates

use thiserror::Error;

/// Invalid configuration value
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, value: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Outcome of a bounded retry loop that did not succeed
#[derive(Error, Debug)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error("retry loop cancelled")]
    Cancelled,
}

impl<E> RetryError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled)
    }

    /// Convert the last attempt's error, keeping cancellation distinct.
    pub fn map_last<F, T>(self, f: F) -> RetryError<T>
    where
        F: FnOnce(E) -> T,
    {
        match self {
            RetryError::Exhausted { attempts, last } => RetryError::Exhausted {
                attempts,
                last: f(last),
            },
            RetryError::Cancelled => RetryError::Cancelled,
        }
    }
}
