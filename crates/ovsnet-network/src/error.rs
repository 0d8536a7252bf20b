//! Driver error types
//!
//! Every failure a lifecycle call can hit, grouped by how the caller should
//! treat it (see [`ErrorCategory`]).

use thiserror::Error;

use ovsnet_core::RetryError;
use ovsnet_ovsdb::TransactionError;

/// How a failure relates to the operation that hit it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad input or a violated precondition; nothing was changed.
    Configuration,
    /// The database or an OS facility could not be reached or refused the request.
    Transport,
    /// Something that should exist after a committed step is not there.
    Consistency,
    /// The daemon is shutting down.
    Cancelled,
}

#[derive(Error, Debug)]
pub enum DriverError {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    #[error("Invalid bridge mode {0:?}, expected nat or flat")]
    InvalidMode(String),

    #[error("Invalid MTU {0:?}, must be a number no smaller than 68")]
    InvalidMtu(String),

    #[error("No usable gateway address in the IPAM data")]
    MissingGateway,

    #[error("Cannot split gateway {0:?} into address and mask")]
    InvalidGateway(String),

    #[error("Network name is required for gateway network type {0}")]
    MissingNetworkName(String),

    #[error("A gateway process is already running on this node")]
    GatewayAlreadyRunning,

    // ========================================================================
    // Transport Errors
    // ========================================================================
    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error("Netlink {op} failed for {name}: {message}")]
    Link {
        op: &'static str,
        name: String,
        message: String,
    },

    #[error("Firewall update for {cidr} failed: {message}")]
    Firewall { cidr: String, message: String },

    #[error("Gateway service {op} failed: {message}")]
    Service { op: &'static str, message: String },

    // ========================================================================
    // Consistency Errors
    // ========================================================================
    #[error("Bridge {0} was not found after its creation committed")]
    BridgeNotCreated(String),

    #[error("Bridge interface {name} not visible after {attempts} attempts")]
    LinkNotVisible { name: String, attempts: u32 },

    #[error("No IPv4 address on bridge interface {0}")]
    NoIpv4Address(String),

    #[error("Bridge {0} has no cached uuid")]
    BridgeUuidNotCached(String),

    #[error("Root Open_vSwitch row is not cached")]
    RootNotCached,

    #[error("No bridge named {0}")]
    BridgeNotFound(String),

    #[error("No port named {0}")]
    PortNotFound(String),

    // ========================================================================
    // Shutdown
    // ========================================================================
    #[error("Operation cancelled")]
    Cancelled,
}

impl DriverError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            DriverError::InvalidMode(_)
            | DriverError::InvalidMtu(_)
            | DriverError::MissingGateway
            | DriverError::InvalidGateway(_)
            | DriverError::MissingNetworkName(_)
            | DriverError::GatewayAlreadyRunning => ErrorCategory::Configuration,
            DriverError::Transaction(_)
            | DriverError::Link { .. }
            | DriverError::Firewall { .. }
            | DriverError::Service { .. } => ErrorCategory::Transport,
            DriverError::BridgeNotCreated(_)
            | DriverError::LinkNotVisible { .. }
            | DriverError::NoIpv4Address(_)
            | DriverError::BridgeUuidNotCached(_)
            | DriverError::RootNotCached
            | DriverError::BridgeNotFound(_)
            | DriverError::PortNotFound(_) => ErrorCategory::Consistency,
            DriverError::Cancelled => ErrorCategory::Cancelled,
        }
    }

    pub(crate) fn link(op: &'static str, name: &str, err: anyhow::Error) -> Self {
        DriverError::Link {
            op,
            name: name.to_string(),
            message: format!("{:#}", err),
        }
    }

    pub(crate) fn service(op: &'static str, err: anyhow::Error) -> Self {
        DriverError::Service {
            op,
            message: format!("{:#}", err),
        }
    }
}

/// Collapse a retry outcome: cancellation stays cancellation, exhaustion uses `exhausted`.
pub(crate) fn from_retry<E>(err: RetryError<E>, exhausted: impl FnOnce(u32, E) -> DriverError) -> DriverError {
    match err {
        RetryError::Cancelled => DriverError::Cancelled,
        RetryError::Exhausted { attempts, last } => exhausted(attempts, last),
    }
}

pub type Result<T, E = DriverError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(DriverError::InvalidMode("vlan".into()).category(), ErrorCategory::Configuration);
        assert_eq!(DriverError::GatewayAlreadyRunning.category(), ErrorCategory::Configuration);
        assert_eq!(
            DriverError::Firewall { cidr: "10.0.0.0/24".into(), message: "exit 1".into() }.category(),
            ErrorCategory::Transport
        );
        assert_eq!(DriverError::RootNotCached.category(), ErrorCategory::Consistency);
        assert_eq!(DriverError::Cancelled.category(), ErrorCategory::Cancelled);
    }

    #[test]
    fn test_from_retry() {
        let err = from_retry(RetryError::Exhausted { attempts: 3, last: "gone".to_string() }, |attempts, _| {
            DriverError::LinkNotVisible {
                name: "ovsbr-28174".into(),
                attempts,
            }
        });
        assert!(err.to_string().contains("after 3 attempts"));
        assert!(matches!(
            from_retry(RetryError::<String>::Cancelled, |_, _| DriverError::RootNotCached),
            DriverError::Cancelled
        ));
    }

    #[test]
    fn test_link_error_keeps_context_chain() {
        let err = DriverError::link(
            "add address",
            "ovsbr-28174",
            anyhow::anyhow!("EEXIST").context("Failed to add IP address"),
        );
        assert_eq!(
            err.to_string(),
            "Netlink add address failed for ovsbr-28174: Failed to add IP address: EEXIST"
        );
    }
}
