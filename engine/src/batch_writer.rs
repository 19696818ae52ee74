//! Queueing, fee/lock-bounded batching, and the anchor/map/chunk trilogy
//! submission (spec §4.6). The real blockchain REST wire client is out of
//! scope (spec §1); this module is the `Blockchain` port plus the writer
//! logic built against it.

use std::collections::VecDeque;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::download::Cas;
use crate::error::{EngineError, Result};
use crate::files::build_trilogy;
use crate::operation::Operation;
use crate::tx_store::{AnchorStringPayload, Transaction};
use crate::types::TransactionTime;

/// Response to `Blockchain::read` (spec §6).
#[derive(Debug, Clone, Default)]
pub struct ReadResponse {
    pub more_transactions: bool,
    pub transactions: Vec<Transaction>,
}

/// An external capability bounding the writer's allowed per-batch operation
/// count (spec §3, §4.6, §6 `GET /locks/{id}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueTimeLock {
    pub amount: u64,
    pub lock_id: u64,
}

/// The blockchain port (spec §6). A real implementation talks to the REST
/// endpoints listed there; this crate only depends on the trait.
#[async_trait]
pub trait Blockchain: Send + Sync {
    async fn read(
        &self,
        since: Option<crate::types::TransactionNumber>,
        since_time_hash: Option<String>,
    ) -> Result<ReadResponse>;

    async fn get_first_valid_transaction(
        &self,
        candidates: &[Transaction],
    ) -> Result<Option<Transaction>>;

    async fn write(&self, anchor_string: String, minimum_fee: u64) -> Result<()>;

    async fn time(&self) -> Result<(TransactionTime, String)>;

    async fn fee(&self, time: TransactionTime) -> Result<u64>;

    async fn writer_lock(&self) -> Result<Option<ValueTimeLock>>;
}

/// Tunables for [`BatchWriter::tick`] (spec §6 config table).
#[derive(Debug, Clone, Copy)]
pub struct BatchWriterConfig {
    pub max_operations_per_batch: usize,
    pub normalized_fee_to_per_operation_fee_multiplier: f64,
    pub value_time_lock_amount_multiplier: f64,
    pub min_number_of_ops_for_value_time_lock: usize,
    pub fee_floor: u64,
}

/// What one successful [`BatchWriter::tick`] produced, for logging/tests.
#[derive(Debug, Clone)]
pub struct WrittenBatch {
    pub anchor_file_hash: String,
    pub map_file_hash: String,
    pub chunk_file_hash: String,
    pub anchor_string: String,
    pub fee: u64,
    pub operation_count: usize,
}

/// The outgoing side of the node (spec §4.6 C7): a local queue of operations
/// waiting to be anchored, drained one fee/lock-bounded batch at a time.
pub struct BatchWriter {
    queue: VecDeque<Operation>,
    config: BatchWriterConfig,
}

impl BatchWriter {
    #[must_use]
    pub fn new(config: BatchWriterConfig) -> Self {
        Self {
            queue: VecDeque::new(),
            config,
        }
    }

    pub fn enqueue(&mut self, operation: Operation) {
        self.queue.push_back(operation);
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    fn max_allowed_by_lock(&self, lock: Option<&ValueTimeLock>, fee: u64) -> usize {
        match lock {
            None => self.config.min_number_of_ops_for_value_time_lock,
            Some(lock) => {
                let fee = fee.max(1) as f64;
                let scaled =
                    (lock.amount as f64 / fee) * self.config.value_time_lock_amount_multiplier;
                (scaled as usize).max(self.config.min_number_of_ops_for_value_time_lock)
            }
        }
    }

    /// Runs one tick of spec §4.6's ten-step sequence. Returns `Ok(None)` if
    /// there was nothing to batch (steps 1-3); leaves the queue untouched and
    /// returns `Err` if any step beyond that fails, so the caller can retry
    /// on the next tick without having lost or duplicated operations.
    pub async fn tick<B, C>(&mut self, blockchain: &B, cas: &C) -> Result<Option<WrittenBatch>>
    where
        B: Blockchain,
        C: Cas,
    {
        let (time, _time_hash) = blockchain.time().await?;
        let fee = blockchain.fee(time).await?;
        let lock = blockchain.writer_lock().await?;

        let allowed = self
            .config
            .max_operations_per_batch
            .min(self.max_allowed_by_lock(lock.as_ref(), fee));
        if allowed == 0 {
            return Ok(None);
        }

        let take = allowed.min(self.queue.len());
        if take == 0 {
            return Ok(None);
        }

        let batch: Vec<Operation> = self.queue.iter().take(take).cloned().collect();

        let (mut anchor, mut map, chunk) =
            build_trilogy(&batch, lock.map(|l| l.lock_id.to_string()))?;

        let chunk_bytes = serde_json::to_vec(&chunk)?;
        let chunk_hash = cas.write(&chunk_bytes).await?;

        map.chunk_file_uri = chunk_hash.clone();
        let map_bytes = serde_json::to_vec(&map)?;
        let map_hash = cas.write(&map_bytes).await?;

        anchor.map_file_uri = map_hash.clone();
        let anchor_bytes = serde_json::to_vec(&anchor)?;
        let anchor_hash = cas.write(&anchor_bytes).await?;

        let anchor_string = serde_json::to_string(&AnchorStringPayload {
            anchor_file_hash: anchor_hash.clone(),
            number_of_operations: batch.len() as u64,
        })?;

        let computed_fee = ((fee as f64)
            * (batch.len() as f64)
            * self.config.normalized_fee_to_per_operation_fee_multiplier)
            .max(self.config.fee_floor as f64) as u64;

        blockchain
            .write(anchor_string.clone(), computed_fee)
            .await
            .map_err(|e| {
                warn!(error = %e, "blockchain write failed, batch left queued for retry");
                EngineError::BlockchainWriteFailed(e.to_string())
            })?;

        for _ in 0..take {
            self.queue.pop_front();
        }

        info!(operation_count = batch.len(), %anchor_hash, "batch anchored");

        Ok(Some(WrittenBatch {
            anchor_file_hash: anchor_hash,
            map_file_hash: map_hash,
            chunk_file_hash: chunk_hash,
            anchor_string,
            fee: computed_fee,
            operation_count: batch.len(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::CasReadOutcome;
    use std::sync::Mutex;

    struct FakeCas {
        store: Mutex<std::collections::HashMap<String, Vec<u8>>>,
    }

    impl FakeCas {
        fn new() -> Self {
            Self {
                store: Mutex::new(std::collections::HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl Cas for FakeCas {
        async fn read(&self, hash: &str, _max_bytes: usize) -> Result<CasReadOutcome> {
            Ok(match self.store.lock().unwrap().get(hash) {
                Some(bytes) => CasReadOutcome::Found(bytes.clone()),
                None => CasReadOutcome::NotFound,
            })
        }

        async fn write(&self, content: &[u8]) -> Result<String> {
            let hash = format!("hash-{}", self.store.lock().unwrap().len());
            self.store.lock().unwrap().insert(hash.clone(), content.to_vec());
            Ok(hash)
        }
    }

    struct FakeBlockchain {
        fee: u64,
        lock: Option<ValueTimeLock>,
        written: Mutex<Vec<(String, u64)>>,
    }

    #[async_trait]
    impl Blockchain for FakeBlockchain {
        async fn read(
            &self,
            _since: Option<crate::types::TransactionNumber>,
            _since_time_hash: Option<String>,
        ) -> Result<ReadResponse> {
            Ok(ReadResponse::default())
        }

        async fn get_first_valid_transaction(
            &self,
            _candidates: &[Transaction],
        ) -> Result<Option<Transaction>> {
            Ok(None)
        }

        async fn write(&self, anchor_string: String, minimum_fee: u64) -> Result<()> {
            self.written.lock().unwrap().push((anchor_string, minimum_fee));
            Ok(())
        }

        async fn time(&self) -> Result<(TransactionTime, String)> {
            Ok((1, "time-hash".to_string()))
        }

        async fn fee(&self, _time: TransactionTime) -> Result<u64> {
            Ok(self.fee)
        }

        async fn writer_lock(&self) -> Result<Option<ValueTimeLock>> {
            Ok(self.lock)
        }
    }

    fn create_op(suffix: &str) -> Operation {
        Operation::Create {
            did_suffix: suffix.to_string(),
            operation_hash: suffix.to_string(),
            signature: "sig".to_string(),
            delta: serde_json::json!({"patches": [], "updateKey": "aa", "recoveryKey": "bb"}),
        }
    }

    #[tokio::test]
    async fn tick_with_an_empty_queue_writes_nothing() {
        let blockchain = FakeBlockchain {
            fee: 10,
            lock: None,
            written: Mutex::new(Vec::new()),
        };
        let cas = FakeCas::new();
        let mut writer = BatchWriter::new(BatchWriterConfig {
            max_operations_per_batch: 10,
            normalized_fee_to_per_operation_fee_multiplier: 1.0,
            value_time_lock_amount_multiplier: 1.0,
            min_number_of_ops_for_value_time_lock: 5,
            fee_floor: 1,
        });

        let result = writer.tick(&blockchain, &cas).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn tick_batches_queued_operations_and_dequeues_only_on_success() {
        let blockchain = FakeBlockchain {
            fee: 10,
            lock: None,
            written: Mutex::new(Vec::new()),
        };
        let cas = FakeCas::new();
        let mut writer = BatchWriter::new(BatchWriterConfig {
            max_operations_per_batch: 10,
            normalized_fee_to_per_operation_fee_multiplier: 1.0,
            value_time_lock_amount_multiplier: 1.0,
            min_number_of_ops_for_value_time_lock: 5,
            fee_floor: 1,
        });
        writer.enqueue(create_op("a"));
        writer.enqueue(create_op("b"));

        let written = writer.tick(&blockchain, &cas).await.unwrap().unwrap();
        assert_eq!(written.operation_count, 2);
        assert_eq!(writer.queue_len(), 0);
        assert_eq!(blockchain.written.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn value_time_lock_caps_how_many_operations_are_taken() {
        let blockchain = FakeBlockchain {
            fee: 10,
            lock: Some(ValueTimeLock { amount: 10, lock_id: 1 }),
            written: Mutex::new(Vec::new()),
        };
        let cas = FakeCas::new();
        let mut writer = BatchWriter::new(BatchWriterConfig {
            max_operations_per_batch: 100,
            normalized_fee_to_per_operation_fee_multiplier: 1.0,
            value_time_lock_amount_multiplier: 0.1,
            min_number_of_ops_for_value_time_lock: 1,
            fee_floor: 1,
        });
        for i in 0..5 {
            writer.enqueue(create_op(&format!("op-{i}")));
        }

        // lock.amount / fee * multiplier = 10 / 10 * 0.1 = 0.1 -> floored to
        // 0, then raised to the configured minimum of 1.
        let written = writer.tick(&blockchain, &cas).await.unwrap().unwrap();
        assert_eq!(written.operation_count, 1);
        assert_eq!(writer.queue_len(), 4);
    }
}
