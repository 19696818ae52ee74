//! Transaction persistence contract (spec §4.3): the observer's crash-recovery
//! and retry-scheduling dependency. The real store (e.g. MongoDB-backed) is
//! out of scope (spec §1); this module defines the contract as an
//! `#[async_trait]` port plus an in-memory implementation that satisfies it
//! for tests and the demo binary.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::types::{TransactionNumber, TransactionTime};

/// Base retry backoff unit (spec §3 `UnresolvableTransaction` invariant).
pub const RETRY_BASE_MS: u64 = 60_000;

/// An immutable record anchored on the blockchain (spec §3). `fee_paid` is
/// an expansion beyond spec.md's minimal field list: §4.5 explicitly orders
/// the rate limiter's buffer by `transactionFeePaid DESC`, so the fee a
/// transaction paid has to live somewhere on this type even though §3's
/// prose omits it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_number: TransactionNumber,
    pub transaction_time: TransactionTime,
    pub transaction_time_hash: String,
    pub anchor_file_hash: String,
    pub anchor_string: String,
    pub fee_paid: u64,
}

/// A [`Transaction`] whose anchor/map/chunk trilogy has been fetched from CAS
/// (spec §3). `batch_file_hash` carries the legacy "batch file" identifier;
/// in this trilogy (anchor/map/chunk, no separate batch file) it aliases
/// `chunk_file_hash`, since the chunk file is where `OperationInfo.batchFileHash`
/// is dereferenced to fetch an operation's delta (spec §4.7 `resolve`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedTransaction {
    pub transaction: Transaction,
    pub batch_file_hash: String,
    pub map_file_hash: String,
    pub chunk_file_hash: String,
}

/// The blockchain payload a transaction carries (spec §6 "anchor string"): a
/// compact pointer to the anchor file plus the declared operation count the
/// rate limiter caps on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorStringPayload {
    pub anchor_file_hash: String,
    pub number_of_operations: u64,
}

/// A [`Transaction`] whose files could not yet be fetched, with retry bookkeeping
/// (spec §3 invariant: `next_retry = first_fetch + 2^attempts * RETRY_BASE_MS`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnresolvableTransaction {
    pub transaction: Transaction,
    pub first_fetch_time_ms: u64,
    pub retry_attempts: u32,
    pub next_retry_time_ms: u64,
}

impl UnresolvableTransaction {
    fn first_attempt(transaction: Transaction, now_ms: u64) -> Self {
        Self {
            transaction,
            first_fetch_time_ms: now_ms,
            retry_attempts: 0,
            next_retry_time_ms: now_ms,
        }
    }

    fn record_another_attempt(&mut self) {
        self.retry_attempts += 1;
        self.next_retry_time_ms =
            self.first_fetch_time_ms + (1u64 << self.retry_attempts) * RETRY_BASE_MS;
    }
}

/// The persistence contract the observer depends on for crash recovery and
/// retry scheduling (spec §4.3).
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Idempotent: a no-op if `tx.transaction_number <= last.transaction_number`.
    async fn add_processed_transaction(&self, tx: Transaction) -> Result<()>;

    /// The processed transaction of maximum `transaction_number`, if any.
    async fn get_last_transaction(&self) -> Result<Option<Transaction>>;

    /// Reverse-chronological probes at doubling distance from the last
    /// transaction: indices `last, last-1, last-3, last-7, ...` — used to
    /// locate the deepest still-valid ancestor after a reorg.
    async fn get_exponentially_spaced_transactions(&self) -> Result<Vec<Transaction>>;

    /// First call creates an unresolvable record (`attempts = 0`,
    /// `next_retry = now`); later calls increment `attempts` and recompute
    /// `next_retry`.
    async fn record_unresolvable_transaction_fetch_attempt(
        &self,
        tx: &Transaction,
        now_ms: u64,
    ) -> Result<()>;

    async fn remove_unresolvable_transaction(&self, tx: &Transaction) -> Result<()>;

    /// Unresolvable transactions whose `next_retry_time_ms <= now_ms`, earliest
    /// `transaction_number` first, capped at `max_return` if given.
    async fn get_unresolvable_transactions_due_for_retry(
        &self,
        now_ms: u64,
        max_return: Option<usize>,
    ) -> Result<Vec<Transaction>>;

    /// Drops every processed/unresolvable transaction with
    /// `transaction_number > n`; clears everything if `n` is absent.
    async fn remove_transactions_later_than(&self, n: Option<TransactionNumber>) -> Result<()>;
}

#[derive(Debug, Default)]
struct Inner {
    processed: BTreeMap<TransactionNumber, Transaction>,
    unresolvable: BTreeMap<TransactionNumber, UnresolvableTransaction>,
}

/// The in-memory reference implementation of [`TransactionStore`] (spec §1:
/// "the MongoDB store implementation" is out of scope; this is the
/// crash-recovery-less stand-in used by tests and the demo binary).
#[derive(Debug, Default)]
pub struct InMemoryTransactionStore {
    inner: Mutex<Inner>,
}

impl InMemoryTransactionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn add_processed_transaction(&self, tx: Transaction) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let last_number = inner.processed.keys().next_back().copied();
        if let Some(last) = last_number {
            if tx.transaction_number <= last {
                return Ok(());
            }
        }
        inner.processed.insert(tx.transaction_number, tx);
        Ok(())
    }

    async fn get_last_transaction(&self) -> Result<Option<Transaction>> {
        let inner = self.inner.lock().await;
        Ok(inner.processed.values().next_back().cloned())
    }

    async fn get_exponentially_spaced_transactions(&self) -> Result<Vec<Transaction>> {
        let inner = self.inner.lock().await;
        let numbers: Vec<TransactionNumber> = inner.processed.keys().copied().collect();
        if numbers.is_empty() {
            return Ok(Vec::new());
        }

        let mut probes = Vec::new();
        let mut offset: u64 = 0;
        loop {
            let index = numbers.len() as i64 - 1 - offset as i64;
            if index < 0 {
                break;
            }
            probes.push(numbers[index as usize]);
            offset = 2 * offset + 1;
        }

        Ok(probes
            .into_iter()
            .map(|n| inner.processed[&n].clone())
            .collect())
    }

    async fn record_unresolvable_transaction_fetch_attempt(
        &self,
        tx: &Transaction,
        now_ms: u64,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .unresolvable
            .entry(tx.transaction_number)
            .and_modify(UnresolvableTransaction::record_another_attempt)
            .or_insert_with(|| UnresolvableTransaction::first_attempt(tx.clone(), now_ms));
        Ok(())
    }

    async fn remove_unresolvable_transaction(&self, tx: &Transaction) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.unresolvable.remove(&tx.transaction_number);
        Ok(())
    }

    async fn get_unresolvable_transactions_due_for_retry(
        &self,
        now_ms: u64,
        max_return: Option<usize>,
    ) -> Result<Vec<Transaction>> {
        let inner = self.inner.lock().await;
        let due = inner
            .unresolvable
            .values()
            .filter(|entry| entry.next_retry_time_ms <= now_ms)
            .map(|entry| entry.transaction.clone());
        Ok(match max_return {
            Some(cap) => due.take(cap).collect(),
            None => due.collect(),
        })
    }

    async fn remove_transactions_later_than(&self, n: Option<TransactionNumber>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match n {
            None => {
                inner.processed.clear();
                inner.unresolvable.clear();
            }
            Some(n) => {
                inner.processed.retain(|&number, _| number <= n);
                inner.unresolvable.retain(|&number, _| number <= n);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(number: TransactionNumber) -> Transaction {
        Transaction {
            transaction_number: number,
            transaction_time: number,
            transaction_time_hash: format!("hash-{number}"),
            anchor_file_hash: format!("anchor-{number}"),
            anchor_string: format!("{{\"anchorFileHash\":\"anchor-{number}\",\"numberOfOperations\":1}}"),
            fee_paid: 100,
        }
    }

    #[tokio::test]
    async fn add_processed_transaction_is_idempotent_against_older_numbers() {
        let store = InMemoryTransactionStore::new();
        store.add_processed_transaction(tx(5)).await.unwrap();
        store.add_processed_transaction(tx(3)).await.unwrap();

        let last = store.get_last_transaction().await.unwrap().unwrap();
        assert_eq!(last.transaction_number, 5);
    }

    #[tokio::test]
    async fn exponentially_spaced_transactions_double_the_distance_each_step() {
        let store = InMemoryTransactionStore::new();
        for n in 0..=10 {
            store.add_processed_transaction(tx(n)).await.unwrap();
        }

        let probes = store.get_exponentially_spaced_transactions().await.unwrap();
        let numbers: Vec<_> = probes.iter().map(|t| t.transaction_number).collect();
        assert_eq!(numbers, vec![10, 9, 7, 3]);
    }

    #[tokio::test]
    async fn unresolvable_retry_schedule_doubles_with_each_attempt() {
        let store = InMemoryTransactionStore::new();
        let t = tx(1);
        store
            .record_unresolvable_transaction_fetch_attempt(&t, 1_000)
            .await
            .unwrap();
        store
            .record_unresolvable_transaction_fetch_attempt(&t, 1_500)
            .await
            .unwrap();

        let due = store
            .get_unresolvable_transactions_due_for_retry(1_000 + 2 * RETRY_BASE_MS, None)
            .await
            .unwrap();
        assert_eq!(due.len(), 1);

        let not_yet_due = store
            .get_unresolvable_transactions_due_for_retry(1_000 + 2 * RETRY_BASE_MS - 1, None)
            .await
            .unwrap();
        assert!(not_yet_due.is_empty());
    }

    #[tokio::test]
    async fn remove_transactions_later_than_clears_both_collections() {
        let store = InMemoryTransactionStore::new();
        for n in 0..=5 {
            store.add_processed_transaction(tx(n)).await.unwrap();
        }
        store
            .record_unresolvable_transaction_fetch_attempt(&tx(6), 0)
            .await
            .unwrap();

        store.remove_transactions_later_than(Some(3)).await.unwrap();

        let last = store.get_last_transaction().await.unwrap().unwrap();
        assert_eq!(last.transaction_number, 3);

        let due = store
            .get_unresolvable_transactions_due_for_retry(u64::MAX, None)
            .await
            .unwrap();
        assert!(due.is_empty());
    }

    #[tokio::test]
    async fn remove_transactions_later_than_none_clears_everything() {
        let store = InMemoryTransactionStore::new();
        for n in 0..=5 {
            store.add_processed_transaction(tx(n)).await.unwrap();
        }
        store.remove_transactions_later_than(None).await.unwrap();
        assert!(store.get_last_transaction().await.unwrap().is_none());
    }
}
