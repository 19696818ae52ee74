//! The periodic ingestion pipeline (spec §4.8, C9): fetches transactions,
//! downloads their anchor/map/chunk files, feeds parsed operations to the
//! processor, and detects/recovers from blockchain reorganizations.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use engine::{
    Blockchain, Cas, CasReadOutcome, DownloadManager, EngineError, Operation, OperationProcessor,
    Transaction, TransactionNumber, TransactionStore,
};

use crate::config::NodeConfig;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InFlightStatus {
    Pending,
    Processed,
}

#[derive(Debug, Clone)]
struct InFlightTransaction {
    transaction: Transaction,
    status: InFlightStatus,
}

type InFlightList = Arc<Mutex<Vec<InFlightTransaction>>>;

/// Drives the observer loop (spec §4.8). Owns the DID operation DAG and the
/// observer's own bookkeeping; `blockchain`/`cas`/`transaction_store` are
/// ports so tests and the demo binary can swap in in-memory fakes. All
/// fields are `Arc`-wrapped so `spawn_download_and_process` can hand owned
/// clones to a detached `tokio::spawn`ed task (spec §4.8: downloads must not
/// be awaited individually).
pub struct Observer<B, C, S> {
    blockchain: Arc<B>,
    download_manager: Arc<DownloadManager<C>>,
    transaction_store: Arc<S>,
    processor: Arc<Mutex<OperationProcessor>>,
    config: NodeConfig,
    last_known_transaction: Mutex<Option<Transaction>>,
    in_flight: InFlightList,
}

impl<B, C, S> Observer<B, C, S>
where
    B: Blockchain + 'static,
    C: Cas + 'static,
    S: TransactionStore + 'static,
{
    pub fn new(
        blockchain: Arc<B>,
        cas: Arc<C>,
        transaction_store: Arc<S>,
        processor: Arc<Mutex<OperationProcessor>>,
        config: NodeConfig,
    ) -> Self {
        let download_manager = Arc::new(DownloadManager::new(cas, config.max_concurrent_downloads));
        Self {
            blockchain,
            download_manager,
            transaction_store,
            processor,
            config,
            last_known_transaction: Mutex::new(None),
            in_flight: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Runs the loop forever at `observing_interval_in_seconds`. Intended to
    /// be spawned as its own task; `run_once` is the unit of work a test
    /// drives directly.
    pub async fn run(&self) -> Result<()> {
        let interval = Duration::from_secs(self.config.observing_interval_in_seconds.max(1));
        loop {
            self.run_once().await?;
            tokio::time::sleep(interval).await;
        }
    }

    /// One invocation of the pipeline (spec §4.8 steps 1-4).
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<()> {
        self.store_consecutive_transactions_processed().await?;

        let mut reorg_detected = false;
        loop {
            let (since, since_time_hash) = {
                let last = self.last_known_transaction.lock().await;
                match last.as_ref() {
                    Some(tx) => (Some(tx.transaction_number), Some(tx.transaction_time_hash.clone())),
                    None => (None, None),
                }
            };

            let response = match self.blockchain.read(since, since_time_hash).await {
                Ok(response) => response,
                Err(EngineError::InvalidTransactionNumberOrTimeHash(reason)) => {
                    warn!(%reason, "reorg detected");
                    reorg_detected = true;
                    engine::ReadResponse {
                        more_transactions: false,
                        transactions: Vec::new(),
                    }
                }
                Err(e) => return Err(e.into()),
            };

            let more_transactions = response.more_transactions;
            let last_in_batch = response.transactions.last().cloned();

            for tx in response.transactions {
                self.in_flight.lock().await.push(InFlightTransaction {
                    transaction: tx.clone(),
                    status: InFlightStatus::Pending,
                });
                self.spawn_download_and_process(tx);
            }

            if let Some(last) = last_in_batch {
                *self.last_known_transaction.lock().await = Some(last);
            }

            if reorg_detected {
                self.drain_in_flight().await;
                self.revert_invalid_transactions().await?;
                break;
            }

            self.wait_for_back_pressure().await;

            if !more_transactions {
                break;
            }
        }

        self.store_consecutive_transactions_processed().await?;
        self.process_due_retries().await?;

        Ok(())
    }

    /// Polls every second until the in-flight list is at or below the
    /// configured cap, draining the processed prefix while it waits. This is
    /// the system's sole back-pressure mechanism (spec §5).
    async fn wait_for_back_pressure(&self) {
        loop {
            let len = self.in_flight.lock().await.len();
            if len <= self.config.max_concurrent_downloads {
                break;
            }
            let _ = self.store_consecutive_transactions_processed().await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    async fn drain_in_flight(&self) {
        loop {
            let all_processed = self
                .in_flight
                .lock()
                .await
                .iter()
                .all(|t| t.status == InFlightStatus::Processed);
            if all_processed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Commits the maximal already-processed prefix of the in-flight list to
    /// the transaction store, preserving `transactionNumber`-ascending
    /// commit order (spec §4.8 ordering invariant).
    async fn store_consecutive_transactions_processed(&self) -> Result<()> {
        let mut in_flight = self.in_flight.lock().await;
        let mut committed = 0;
        for entry in in_flight.iter() {
            if entry.status != InFlightStatus::Processed {
                break;
            }
            self.transaction_store
                .add_processed_transaction(entry.transaction.clone())
                .await
                .map_err(EngineError::from)?;
            committed += 1;
        }
        in_flight.drain(..committed);
        Ok(())
    }

    /// Kicks off `download_and_process` as a detached task (spec §4.8: "do
    /// not await individually"); its completion updates the shared in-flight
    /// list and retry bookkeeping just as the synchronous path does.
    fn spawn_download_and_process(&self, transaction: Transaction) {
        let download_manager = self.download_manager.clone();
        let processor = self.processor.clone();
        let transaction_store = self.transaction_store.clone();
        let in_flight = self.in_flight.clone();
        let config = self.config;

        tokio::spawn(async move {
            let retry_needed =
                process_transaction_files(&download_manager, &processor, &config, &transaction).await;
            finish_transaction(&in_flight, transaction_store.as_ref(), &transaction, retry_needed).await;
        });
    }

    /// Synchronous entry point used by the retry path and by tests: performs
    /// the same work as the spawned path but awaits it in place.
    async fn download_and_process(&self, transaction: &Transaction) -> bool {
        let retry_needed =
            process_transaction_files(&self.download_manager, &self.processor, &self.config, transaction).await;
        finish_transaction(&self.in_flight, self.transaction_store.as_ref(), transaction, retry_needed).await;
        retry_needed
    }

    /// Locates the best-known-valid ancestor after a reorg and rolls the
    /// processor and transaction store back to it (spec §4.8
    /// `revertInvalidTransactions`).
    async fn revert_invalid_transactions(&self) -> Result<()> {
        let candidates = self
            .transaction_store
            .get_exponentially_spaced_transactions()
            .await
            .map_err(EngineError::from)?;

        let best_valid = self.blockchain.get_first_valid_transaction(&candidates).await?;

        let resume_from: TransactionNumber = best_valid.as_ref().map_or(0, |tx| tx.transaction_number + 1);

        self.processor.lock().await.rollback(resume_from);
        self.transaction_store
            .remove_transactions_later_than(best_valid.as_ref().map(|tx| tx.transaction_number))
            .await
            .map_err(EngineError::from)?;

        *self.last_known_transaction.lock().await = best_valid;
        Ok(())
    }

    async fn process_due_retries(&self) -> Result<()> {
        let now_ms = now_ms();
        let due = self
            .transaction_store
            .get_unresolvable_transactions_due_for_retry(now_ms, None)
            .await
            .map_err(EngineError::from)?;

        for tx in &due {
            self.download_and_process(tx).await;
        }
        Ok(())
    }
}

/// Downloads and parses one transaction's anchor/map/chunk trilogy and feeds
/// the result to the processor (spec §4.8 `downloadAndProcess`). Returns
/// whether the transaction should be retried later. Free of `Observer` so it
/// can run inside a detached spawned task.
async fn process_transaction_files<C: Cas>(
    download_manager: &DownloadManager<C>,
    processor: &Mutex<OperationProcessor>,
    config: &NodeConfig,
    transaction: &Transaction,
) -> bool {
    let anchor_bytes = match download(download_manager, &transaction.anchor_file_hash, config.max_anchor_file_size_in_bytes).await {
        Downloaded::Found(bytes) => bytes,
        Downloaded::Retry => return true,
        Downloaded::Drop => return false,
    };
    let anchor = match engine::files::parse_anchor_file(&anchor_bytes, config.max_anchor_file_size_in_bytes) {
        Ok(anchor) => anchor,
        Err(e) => {
            debug!(error = %e, "dropping transaction with an unparsable anchor file");
            return false;
        }
    };

    let map_bytes = match download(download_manager, &anchor.map_file_uri, config.max_map_file_size_in_bytes).await {
        Downloaded::Found(bytes) => bytes,
        Downloaded::Retry => return true,
        Downloaded::Drop => return false,
    };
    let map = match engine::files::parse_map_file(&map_bytes, config.max_map_file_size_in_bytes) {
        Ok(map) => map,
        Err(e) => {
            debug!(error = %e, "dropping transaction with an unparsable map file");
            return false;
        }
    };

    let chunk_bytes = match download(download_manager, &map.chunk_file_uri, config.max_batch_file_size_in_bytes).await {
        Downloaded::Found(bytes) => bytes,
        Downloaded::Retry => return true,
        Downloaded::Drop => return false,
    };
    let chunk = match engine::files::parse_chunk_file(&chunk_bytes, config.max_batch_file_size_in_bytes) {
        Ok(chunk) => chunk,
        Err(e) => {
            debug!(error = %e, "dropping transaction with an unparsable chunk file");
            return false;
        }
    };

    let ops = match assemble_operations(&anchor, &map, &chunk) {
        Ok(ops) => ops,
        Err(e) => {
            debug!(error = %e, "dropping transaction with malformed operations");
            return false;
        }
    };

    processor
        .lock()
        .await
        .process_batch(&map.chunk_file_uri, transaction.transaction_number, ops);
    false
}

enum Downloaded {
    Found(Vec<u8>),
    Retry,
    Drop,
}

async fn download<C: Cas>(manager: &DownloadManager<C>, hash: &str, max_bytes: usize) -> Downloaded {
    match manager.download(hash, max_bytes).await {
        Ok(CasReadOutcome::Found(bytes)) => Downloaded::Found(bytes),
        Ok(CasReadOutcome::NotFound) => Downloaded::Retry,
        Ok(CasReadOutcome::TooLarge) | Err(_) => Downloaded::Drop,
    }
}

async fn finish_transaction<S: TransactionStore>(
    in_flight: &InFlightList,
    transaction_store: &S,
    transaction: &Transaction,
    retry_needed: bool,
) {
    {
        let mut in_flight = in_flight.lock().await;
        if let Some(entry) = in_flight
            .iter_mut()
            .find(|t| t.transaction.transaction_number == transaction.transaction_number)
        {
            entry.status = InFlightStatus::Processed;
        }
    }

    if retry_needed {
        let _ = transaction_store
            .record_unresolvable_transaction_fetch_attempt(transaction, now_ms())
            .await;
    } else {
        let _ = transaction_store.remove_unresolvable_transaction(transaction).await;
    }
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn assemble_operations(
    anchor: &engine::files::AnchorFile,
    map: &engine::files::MapFile,
    chunk: &engine::files::ChunkFile,
) -> engine::Result<Vec<Operation>> {
    let mut ops = Vec::with_capacity(anchor.operation_count() + map.update_operations.len());
    let mut deltas = chunk.deltas.iter();

    for header in &anchor.create_operations {
        let delta = deltas
            .next()
            .ok_or_else(|| EngineError::MalformedChunkFile("fewer deltas than create operations".to_string()))?;
        ops.push(Operation::Create {
            did_suffix: header.did_suffix.clone(),
            operation_hash: header.operation_hash.clone(),
            signature: String::new(),
            delta: delta.clone(),
        });
    }

    for header in &anchor.recover_operations {
        let delta = deltas
            .next()
            .ok_or_else(|| EngineError::MalformedChunkFile("fewer deltas than recover operations".to_string()))?;
        ops.push(Operation::Recover {
            did_suffix: header.did_suffix.clone(),
            operation_hash: header.operation_hash.clone(),
            previous_operation_hash: header.previous_operation_hash.clone().unwrap_or_default(),
            reveal_value: header.reveal_value.clone().unwrap_or_default(),
            signature: String::new(),
            delta: delta.clone(),
        });
    }

    for header in &map.update_operations {
        let delta = deltas
            .next()
            .ok_or_else(|| EngineError::MalformedChunkFile("fewer deltas than update operations".to_string()))?;
        ops.push(Operation::Update {
            did_suffix: header.did_suffix.clone(),
            operation_hash: header.operation_hash.clone(),
            previous_operation_hash: header.previous_operation_hash.clone().unwrap_or_default(),
            reveal_value: header.reveal_value.clone().unwrap_or_default(),
            signature: String::new(),
            delta: delta.clone(),
        });
    }

    for header in &anchor.deactivate_operations {
        ops.push(Operation::Deactivate {
            did_suffix: header.did_suffix.clone(),
            operation_hash: header.operation_hash.clone(),
            previous_operation_hash: header.previous_operation_hash.clone().unwrap_or_default(),
            reveal_value: header.reveal_value.clone().unwrap_or_default(),
            signature: String::new(),
        });
    }

    Ok(ops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{InMemoryBlockchain, InMemoryCas};
    use engine::files::build_trilogy;
    use engine::InMemoryTransactionStore;

    fn test_config() -> NodeConfig {
        NodeConfig {
            max_concurrent_downloads: 10,
            observing_interval_in_seconds: 1,
            ..NodeConfig::default()
        }
    }

    fn sample_create(suffix: &str) -> Operation {
        Operation::Create {
            did_suffix: suffix.to_string(),
            operation_hash: suffix.to_string(),
            signature: "sig".to_string(),
            delta: serde_json::json!({
                "patches": [{"action": "replace", "document": {"hello": "world"}}],
                "updateKey": "aa",
                "recoveryKey": "bb",
            }),
        }
    }

    async fn anchor_transaction(
        cas: &InMemoryCas,
        blockchain: &InMemoryBlockchain,
        ops: &[Operation],
    ) -> Transaction {
        let (mut anchor, mut map, chunk) = build_trilogy(ops, None).unwrap();
        let chunk_hash = cas.write(&serde_json::to_vec(&chunk).unwrap()).await.unwrap();
        map.chunk_file_uri = chunk_hash;
        let map_hash = cas.write(&serde_json::to_vec(&map).unwrap()).await.unwrap();
        anchor.map_file_uri = map_hash;
        let anchor_bytes = serde_json::to_vec(&anchor).unwrap();
        let anchor_hash = cas.write(&anchor_bytes).await.unwrap();

        blockchain.push_transaction(
            serde_json::json!({"anchorFileHash": anchor_hash, "numberOfOperations": ops.len()}).to_string(),
            10,
        )
    }

    #[tokio::test]
    async fn download_and_process_feeds_a_create_operation_to_the_processor() {
        let blockchain = Arc::new(InMemoryBlockchain::new());
        let cas = Arc::new(InMemoryCas::new());
        let store = Arc::new(InMemoryTransactionStore::new());
        let processor = Arc::new(Mutex::new(OperationProcessor::new()));

        let ops = vec![sample_create("did-1")];
        let tx = anchor_transaction(&cas, &blockchain, &ops).await;

        let observer = Observer::new(blockchain.clone(), cas.clone(), store.clone(), processor.clone(), test_config());
        let retry_needed = observer.download_and_process(&tx).await;
        assert!(!retry_needed);

        let info = processor.lock().await.info("did-1").cloned();
        assert!(info.is_some());
    }

    #[tokio::test]
    async fn download_and_process_requests_a_retry_when_the_anchor_file_is_missing() {
        let blockchain = Arc::new(InMemoryBlockchain::new());
        let cas = Arc::new(InMemoryCas::new());
        let store = Arc::new(InMemoryTransactionStore::new());
        let processor = Arc::new(Mutex::new(OperationProcessor::new()));

        let tx = blockchain.push_transaction(
            serde_json::json!({"anchorFileHash": "missing-hash", "numberOfOperations": 1}).to_string(),
            10,
        );

        let observer = Observer::new(blockchain, cas, store, processor, test_config());
        let retry_needed = observer.download_and_process(&tx).await;
        assert!(retry_needed);
    }

    #[tokio::test]
    async fn run_once_commits_a_simple_transaction_through_to_the_store() {
        let blockchain = Arc::new(InMemoryBlockchain::new());
        let cas = Arc::new(InMemoryCas::new());
        let store = Arc::new(InMemoryTransactionStore::new());
        let processor = Arc::new(Mutex::new(OperationProcessor::new()));

        let ops = vec![sample_create("did-2")];
        anchor_transaction(&cas, &blockchain, &ops).await;

        let observer = Observer::new(blockchain, cas, store.clone(), processor.clone(), test_config());
        observer.run_once().await.unwrap();

        // allow the spawned download task to complete before re-checking.
        tokio::time::sleep(Duration::from_millis(50)).await;
        observer.run_once().await.unwrap();

        let last = store.get_last_transaction().await.unwrap();
        assert!(last.is_some());
    }
}
