//! Cross-cutting type aliases and small value types shared by the
//! transaction store, operation parser, processor, and rate limiter.

use serde::{Deserialize, Serialize};

/// Monotonically increasing, globally-ordering transaction number (spec §3).
pub type TransactionNumber = u64;

/// Block height at which a transaction was anchored (spec §3).
pub type TransactionTime = u64;

/// Position of an operation within its containing batch.
pub type OperationIndex = u32;

/// The four operation kinds a DID's version DAG can contain (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationType {
    Create,
    Update,
    Recover,
    Deactivate,
}

/// `(transactionNumber, operationIndex)` — the total order operations within
/// a DID are compared by (spec §3 `OperationInfo.timestamp`, V3, V5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationTimestamp {
    pub transaction_number: TransactionNumber,
    pub operation_index: OperationIndex,
}

impl OperationTimestamp {
    #[must_use]
    pub const fn new(
        transaction_number: TransactionNumber,
        operation_index: OperationIndex,
    ) -> Self {
        Self {
            transaction_number,
            operation_index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_order_by_transaction_number_first() {
        let earlier = OperationTimestamp::new(5, 9);
        let later = OperationTimestamp::new(6, 0);
        assert!(earlier < later);
    }

    #[test]
    fn timestamps_order_by_operation_index_within_the_same_transaction() {
        let first = OperationTimestamp::new(5, 0);
        let second = OperationTimestamp::new(5, 1);
        assert!(first < second);
    }
}
