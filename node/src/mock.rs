//! In-memory stand-ins for the blockchain and CAS ports (spec §1: the real
//! wire clients are out of scope). Exercised by this crate's own tests and
//! by the demo binary.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use engine::tx_store::AnchorStringPayload;
use engine::{
    Blockchain, Cas, CasReadOutcome, EngineError, ReadResponse, Result, Transaction, ValueTimeLock,
};

/// An in-memory ledger of anchored transactions, playing the role of the
/// blockchain client (spec §6). `push_transaction` is how a test or the demo
/// binary simulates a new block being anchored.
#[derive(Debug, Default)]
pub struct InMemoryBlockchain {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    transactions: Vec<Transaction>,
    current_time: u64,
    fee: u64,
    lock: Option<ValueTimeLock>,
    /// Set by a test to simulate a reorg: `read` rejects any `since` at or
    /// past this transaction number with `InvalidTransactionNumberOrTimeHash`.
    reorg_cutoff: Option<u64>,
}

impl InMemoryBlockchain {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                fee: 10,
                ..Inner::default()
            }),
        }
    }

    /// The transaction's `anchor_file_hash` is recovered from `anchor_string`
    /// (spec §6: the anchor string is `{anchorFileHash, numberOfOperations}`),
    /// since that is the real CAS pointer the observer downloads — not a
    /// synthetic placeholder. Callers whose `anchor_string` does not carry a
    /// parseable payload (e.g. tests of `read` that never exercise download)
    /// get a placeholder instead.
    pub fn push_transaction(&self, anchor_string: String, fee_paid: u64) -> Transaction {
        let mut inner = self.inner.lock().unwrap();
        inner.current_time += 1;
        let number = inner.transactions.len() as u64;
        let anchor_file_hash = serde_json::from_str::<AnchorStringPayload>(&anchor_string)
            .map(|payload| payload.anchor_file_hash)
            .unwrap_or_else(|_| format!("anchor-{number}"));
        let tx = Transaction {
            transaction_number: number,
            transaction_time: inner.current_time,
            transaction_time_hash: format!("time-hash-{}", inner.current_time),
            anchor_file_hash,
            anchor_string,
            fee_paid,
        };
        inner.transactions.push(tx.clone());
        tx
    }

    pub fn simulate_reorg_at(&self, transaction_number: u64) {
        self.inner.lock().unwrap().reorg_cutoff = Some(transaction_number);
    }

    pub fn set_fee(&self, fee: u64) {
        self.inner.lock().unwrap().fee = fee;
    }

    pub fn set_writer_lock(&self, lock: Option<ValueTimeLock>) {
        self.inner.lock().unwrap().lock = lock;
    }
}

#[async_trait]
impl Blockchain for InMemoryBlockchain {
    async fn read(
        &self,
        since: Option<u64>,
        _since_time_hash: Option<String>,
    ) -> Result<ReadResponse> {
        let inner = self.inner.lock().unwrap();
        if let Some(cutoff) = inner.reorg_cutoff {
            if since.map_or(false, |n| n >= cutoff) {
                return Err(EngineError::InvalidTransactionNumberOrTimeHash(format!(
                    "transaction number {since:?} is past the reorg point"
                )));
            }
        }

        let start = since.map_or(0, |n| n as usize + 1);
        let transactions: Vec<Transaction> = inner
            .transactions
            .iter()
            .skip(start)
            .cloned()
            .collect();
        Ok(ReadResponse {
            more_transactions: false,
            transactions,
        })
    }

    async fn get_first_valid_transaction(
        &self,
        candidates: &[Transaction],
    ) -> Result<Option<Transaction>> {
        let inner = self.inner.lock().unwrap();
        let known: std::collections::HashSet<u64> = inner
            .transactions
            .iter()
            .map(|t| t.transaction_number)
            .collect();
        Ok(candidates
            .iter()
            .filter(|c| known.contains(&c.transaction_number))
            .max_by_key(|c| c.transaction_number)
            .cloned())
    }

    async fn write(&self, anchor_string: String, minimum_fee: u64) -> Result<()> {
        self.push_transaction(anchor_string, minimum_fee);
        Ok(())
    }

    async fn time(&self) -> Result<(u64, String)> {
        let inner = self.inner.lock().unwrap();
        Ok((inner.current_time, format!("time-hash-{}", inner.current_time)))
    }

    async fn fee(&self, _time: u64) -> Result<u64> {
        Ok(self.inner.lock().unwrap().fee)
    }

    async fn writer_lock(&self) -> Result<Option<ValueTimeLock>> {
        Ok(self.inner.lock().unwrap().lock)
    }
}

/// A plain hash-map content store, playing the role of the CAS (spec §6).
#[derive(Debug, Default)]
pub struct InMemoryCas {
    store: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryCas {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Cas for InMemoryCas {
    async fn read(&self, hash: &str, max_bytes: usize) -> Result<CasReadOutcome> {
        let store = self.store.lock().unwrap();
        Ok(match store.get(hash) {
            None => CasReadOutcome::NotFound,
            Some(bytes) if bytes.len() > max_bytes => CasReadOutcome::TooLarge,
            Some(bytes) => CasReadOutcome::Found(bytes.clone()),
        })
    }

    async fn write(&self, content: &[u8]) -> Result<String> {
        let hash = common::multihash::hash_and_encode(content, common::Encoding::Base58Btc)?;
        self.store.lock().unwrap().insert(hash.clone(), content.to_vec());
        Ok(hash)
    }
}
