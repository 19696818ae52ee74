//! Per-transaction-time fee-priority capping of incoming transactions
//! (spec §4.5). Restartable across calls: the in-progress block's buffer is
//! long-lived state, not a pure function over a list (spec §9).

use crate::tx_store::{AnchorStringPayload, Transaction};
use crate::types::TransactionTime;

fn parsed_operation_count(anchor_string: &str) -> Option<u64> {
    serde_json::from_str::<AnchorStringPayload>(anchor_string)
        .ok()
        .map(|payload| payload.number_of_operations)
}

#[derive(Debug, Clone)]
struct BufferedTransaction {
    transaction: Transaction,
    /// `None` when `anchor_string` failed to parse: the transaction is
    /// accepted unconditionally (spec §4.5), its count left for the
    /// processor to discover it can't process it.
    operation_count: Option<u64>,
}

/// Caps the operations admitted per transaction-time by fee priority
/// (spec §4.5). Transactions within the same `transaction_time` buffer up;
/// once `transaction_time` advances, the buffered block is flushed: popped
/// in `(fee DESC, transaction_number ASC)` order while the running operation
/// count stays within `max_operations_per_transaction_time`, then the
/// accepted set is re-sorted by `transaction_number` ascending for emission.
#[derive(Debug)]
pub struct OperationRateLimiter {
    current_time: Option<TransactionTime>,
    buffer: Vec<BufferedTransaction>,
    max_operations_per_transaction_time: u64,
}

impl OperationRateLimiter {
    #[must_use]
    pub fn new(max_operations_per_transaction_time: u64) -> Self {
        Self {
            current_time: None,
            buffer: Vec::new(),
            max_operations_per_transaction_time,
        }
    }

    fn push(&mut self, tx: Transaction) {
        let operation_count = parsed_operation_count(&tx.anchor_string);
        self.buffer.push(BufferedTransaction {
            transaction: tx,
            operation_count,
        });
    }

    /// Feeds one transaction, assumed to arrive in `transaction_time`
    /// ascending (and `transaction_number` ascending within a tied time).
    /// Returns the previous block's accepted set once `transaction_time`
    /// advances past it; otherwise an empty vector.
    pub fn add_transaction(&mut self, tx: Transaction) -> Vec<Transaction> {
        match self.current_time {
            Some(current) if current == tx.transaction_time => {
                self.push(tx);
                Vec::new()
            }
            None => {
                self.current_time = Some(tx.transaction_time);
                self.push(tx);
                Vec::new()
            }
            Some(_) => {
                let flushed = self.flush();
                self.current_time = Some(tx.transaction_time);
                self.push(tx);
                flushed
            }
        }
    }

    fn flush(&mut self) -> Vec<Transaction> {
        let mut pending = std::mem::take(&mut self.buffer);
        pending.sort_by(|a, b| {
            b.transaction
                .fee_paid
                .cmp(&a.transaction.fee_paid)
                .then(a.transaction.transaction_number.cmp(&b.transaction.transaction_number))
        });

        let mut accepted = Vec::new();
        let mut operations_so_far = 0u64;
        for entry in pending {
            match entry.operation_count {
                None => accepted.push(entry.transaction),
                Some(count) => {
                    if operations_so_far + count <= self.max_operations_per_transaction_time {
                        operations_so_far += count;
                        accepted.push(entry.transaction);
                    } else {
                        break;
                    }
                }
            }
        }

        accepted.sort_by_key(|tx| tx.transaction_number);
        accepted
    }

    /// Flushes whatever remains buffered without waiting for a new
    /// `transaction_time` to arrive (e.g. the observer calling this at the
    /// end of a fetch loop that ran dry).
    pub fn flush_remaining(&mut self) -> Vec<Transaction> {
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(number: u64, time: u64, fee: u64, operation_count: u64) -> Transaction {
        Transaction {
            transaction_number: number,
            transaction_time: time,
            transaction_time_hash: format!("hash-{time}"),
            anchor_file_hash: format!("anchor-{number}"),
            anchor_string: format!(
                "{{\"anchorFileHash\":\"anchor-{number}\",\"numberOfOperations\":{operation_count}}}"
            ),
            fee_paid: fee,
        }
    }

    #[test]
    fn caps_the_block_by_fee_priority_and_emits_by_transaction_number() {
        let mut limiter = OperationRateLimiter::new(25);
        limiter.add_transaction(tx(1, 100, 333, 12));
        limiter.add_transaction(tx(2, 100, 999, 11));
        limiter.add_transaction(tx(3, 100, 998, 8));
        let flushed = limiter.add_transaction(tx(4, 100, 14, 1));
        assert!(flushed.is_empty());

        let final_block = limiter.add_transaction(tx(5, 101, 500, 1));
        assert!(final_block.is_empty(), "flush only fires when time 100's block ends");

        let accepted: Vec<u64> = {
            let mut l = OperationRateLimiter::new(25);
            l.add_transaction(tx(1, 100, 333, 12));
            l.add_transaction(tx(2, 100, 999, 11));
            l.add_transaction(tx(3, 100, 998, 8));
            l.add_transaction(tx(4, 100, 14, 1));
            let flushed = l.add_transaction(tx(5, 101, 500, 1));
            flushed.into_iter().map(|t| t.transaction_number).collect()
        };
        assert_eq!(accepted, vec![2, 3]);
    }

    #[test]
    fn malformed_anchor_string_is_accepted_unconditionally() {
        let mut limiter = OperationRateLimiter::new(1);
        limiter.add_transaction(Transaction {
            transaction_number: 1,
            transaction_time: 100,
            transaction_time_hash: "hash-100".to_string(),
            anchor_file_hash: "anchor-1".to_string(),
            anchor_string: "not json".to_string(),
            fee_paid: 1,
        });
        let flushed = limiter.add_transaction(tx(2, 101, 10, 1));
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].transaction_number, 1);
    }

    #[test]
    fn the_final_partial_block_stays_buffered_until_flush_remaining_is_called() {
        let mut limiter = OperationRateLimiter::new(25);
        limiter.add_transaction(tx(1, 100, 10, 1));
        assert_eq!(limiter.flush_remaining().len(), 1);
    }
}
