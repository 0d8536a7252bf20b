//! OVSDB error types

use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use crate::protocol::Operation;

/// Transport-level failures talking to the switch database
#[derive(Error, Debug)]
pub enum OvsdbError {
    #[error("Failed to connect to OVSDB at {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("OVSDB I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid OVSDB JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("OVSDB error reply to {method}: {error}")]
    Rpc { method: String, error: Value },

    #[error("OVSDB {method} timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("OVSDB connection closed")]
    Closed,

    #[error("Malformed OVSDB reply: {0}")]
    Malformed(String),
}

/// A transaction that was rejected, partially answered, or never delivered.
///
/// Always carries the submitted operation list for diagnostics.
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error(
        "Number of replies ({replies}) should be at least equal to number of operations ({})",
        .operations.len()
    )]
    ShortReply {
        replies: usize,
        operations: Vec<Operation>,
    },

    #[error("Transaction failed due to an error: {error}{}", details_suffix(.details))]
    Failed {
        error: String,
        details: Option<String>,
        index: usize,
        operation: Option<Operation>,
        operations: Vec<Operation>,
    },

    #[error("Transaction could not be submitted: {source}")]
    Transport {
        #[source]
        source: OvsdbError,
        operations: Vec<Operation>,
    },
}

fn details_suffix(details: &Option<String>) -> String {
    match details.as_deref() {
        Some(d) if !d.is_empty() => format!(" details: {}", d),
        _ => String::new(),
    }
}

impl TransactionError {
    /// The operations that were submitted, in order.
    pub fn operations(&self) -> &[Operation] {
        match self {
            TransactionError::ShortReply { operations, .. }
            | TransactionError::Failed { operations, .. }
            | TransactionError::Transport { operations, .. } => operations,
        }
    }

    /// First error message reported by the database, if it got that far.
    pub fn first_error(&self) -> Option<&str> {
        match self {
            TransactionError::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    /// The operation the first error was reported against.
    pub fn failed_operation(&self) -> Option<&Operation> {
        match self {
            TransactionError::Failed { operation, .. } => operation.as_ref(),
            _ => None,
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, TransactionError::Transport { .. })
    }
}

/// Failures bringing up the cache synchronizer
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Failed to start OVSDB monitor: {0}")]
    Monitor(#[from] OvsdbError),

    #[error("Root Open_vSwitch row never appeared in the cache: {0}")]
    RootRow(String),

    #[error("Cache synchronization cancelled during startup")]
    Cancelled,
}
