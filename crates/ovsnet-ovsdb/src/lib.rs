//! ovsnet-ovsdb: the switch database as the driver sees it
//!
//! - Wire types for `transact` and `monitor` ([`protocol`])
//! - A JSON-RPC client behind the [`OvsdbTransport`] seam
//! - [`Transaction`], which submits operations atomically and validates every result
//! - [`DbCache`], kept current by the [`sync`] task, and the [`ContextCache`]

pub mod cache;
pub mod client;
pub mod context;
pub mod error;
pub mod protocol;
pub mod sync;
pub mod transaction;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cache::DbCache;
pub use client::{OvsdbClient, OvsdbTransport};
pub use context::ContextCache;
pub use error::{OvsdbError, SyncError, TransactionError};
pub use protocol::{datum, Condition, Mutation, Operation, OperationResult, Row, TableUpdates};
pub use sync::{SyncHandle, UpdateForwarder};
pub use transaction::Transaction;
