//! Atomic multi-operation transactions with per-operation result validation.
//!
//! No retry policy lives here: callers decide whether a failed transaction is fatal.

use tracing::{debug, error};

use crate::client::OvsdbTransport;
use crate::error::TransactionError;
use crate::protocol::{Operation, OperationResult, DATABASE};

/// Ordered operations submitted as one `transact` request.
#[derive(Debug, Clone)]
pub struct Transaction {
    database: String,
    operations: Vec<Operation>,
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Transaction {
    pub fn new() -> Self {
        Self::with_database(DATABASE)
    }

    pub fn with_database(database: &str) -> Self {
        Self {
            database: database.to_string(),
            operations: Vec::new(),
        }
    }

    pub fn add(mut self, operation: Operation) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn push(&mut self, operation: Operation) -> &mut Self {
        self.operations.push(operation);
        self
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Submit and validate. On success returns one result per operation (plus any
    /// trailing results the server appended).
    pub async fn commit(
        self,
        transport: &dyn OvsdbTransport,
    ) -> Result<Vec<OperationResult>, TransactionError> {
        debug!(
            "Submitting OVSDB transaction with {} operations",
            self.operations.len()
        );
        let results = match transport.transact(&self.database, &self.operations).await {
            Ok(results) => results,
            Err(source) => {
                error!("OVSDB transaction could not be submitted: {}", source);
                return Err(TransactionError::Transport {
                    source,
                    operations: self.operations,
                });
            }
        };
        check_results(&self.operations, &results)?;
        Ok(results)
    }
}

/// Accept only if there is a result for every operation and no result carries an error.
pub fn check_results(
    operations: &[Operation],
    results: &[OperationResult],
) -> Result<(), TransactionError> {
    if results.len() < operations.len() {
        error!(
            "Number of replies ({}) should be at least equal to number of operations ({})",
            results.len(),
            operations.len()
        );
        return Err(TransactionError::ShortReply {
            replies: results.len(),
            operations: operations.to_vec(),
        });
    }

    for (index, result) in results.iter().enumerate() {
        if let Some(message) = result.error() {
            // Results past the operation count describe the commit itself.
            let operation = operations.get(index).cloned();
            match &operation {
                Some(op) => error!(
                    "Transaction failed due to an error: {} in operation {:?} on {}",
                    message, op.op, op.table
                ),
                None => error!("Transaction failed due to an error: {}", message),
            }
            return Err(TransactionError::Failed {
                error: message.to_string(),
                details: result.details.clone(),
                index,
                operation,
                operations: operations.to_vec(),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Condition, Row};

    fn ops() -> Vec<Operation> {
        vec![
            Operation::delete("Bridge", vec![Condition::eq("name", "br0")]),
            Operation::delete("BridgeOpt", vec![Condition::eq("name", "br0")]),
        ]
    }

    fn ok() -> OperationResult {
        OperationResult {
            count: Some(1),
            ..Default::default()
        }
    }

    #[test]
    fn test_accepts_complete_clean_results() {
        assert!(check_results(&ops(), &[ok(), ok()]).is_ok());
        // trailing extra results are fine
        assert!(check_results(&ops(), &[ok(), ok(), OperationResult::default()]).is_ok());
    }

    #[test]
    fn test_short_reply_keeps_operations() {
        let err = check_results(&ops(), &[ok()]).unwrap_err();
        assert!(matches!(err, TransactionError::ShortReply { replies: 1, .. }));
        assert_eq!(err.operations(), ops().as_slice());
        assert!(err.first_error().is_none());
    }

    #[test]
    fn test_first_error_and_operation_recoverable() {
        let failing = OperationResult {
            error: Some("referential integrity violation".to_string()),
            details: Some("row still referenced".to_string()),
            ..Default::default()
        };
        let second = OperationResult {
            error: Some("later error".to_string()),
            ..Default::default()
        };
        let err = check_results(&ops(), &[ok(), failing, second]).unwrap_err();

        assert_eq!(err.first_error(), Some("referential integrity violation"));
        assert_eq!(err.failed_operation().map(|op| op.table.as_str()), Some("BridgeOpt"));
        assert_eq!(err.operations().len(), 2);
        assert!(err.to_string().contains("details: row still referenced"));
    }

    #[test]
    fn test_commit_error_past_operation_count() {
        let commit_failure = OperationResult {
            error: Some("timed out".to_string()),
            ..Default::default()
        };
        let err = check_results(&ops(), &[ok(), ok(), commit_failure]).unwrap_err();
        assert_eq!(err.first_error(), Some("timed out"));
        assert!(err.failed_operation().is_none());
    }

    #[test]
    fn test_empty_error_string_is_not_an_error() {
        let blank = OperationResult {
            error: Some(String::new()),
            rows: Some(vec![Row::new()]),
            ..Default::default()
        };
        assert!(check_results(&ops(), &[blank, ok()]).is_ok());
    }

    #[test]
    fn test_builder() {
        let mut tx = Transaction::new();
        tx.push(ops()[0].clone());
        let tx = tx.add(ops()[1].clone());
        assert_eq!(tx.len(), 2);
        assert!(!tx.is_empty());
        assert_eq!(tx.operations()[1].table, "BridgeOpt");
    }
}
