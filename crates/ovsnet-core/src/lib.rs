//! ovsnet-core: shared plumbing for the OVS container network driver
//!
//! - Environment-file loading and [`DriverConfig`]
//! - Bounded, cancellable retry loops ([`RetryPolicy`], [`Cancellation`])
//! - Error types used by every other crate

pub mod config;
pub mod error;
pub mod retry;

pub use config::{DriverConfig, OvsdbEndpoint};
pub use error::{ConfigError, RetryError};
pub use retry::{cancellation, CancelHandle, Cancellation, RetryPolicy};
