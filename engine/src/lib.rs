//! The operation DAG, rate limiter, batch writer, and transaction store
//! contract for a DID layer-2 observer node (spec §4.3-§4.7).
//!
//! This crate has no knowledge of a concrete blockchain or CAS wire
//! protocol: it exposes the [`Blockchain`] and [`Cas`] ports that the
//! download manager and batch writer are built against, and leaves
//! concrete implementations (real or in-memory) to downstream crates.

pub mod batch_writer;
pub mod download;
pub mod error;
pub mod files;
pub mod operation;
pub mod processor;
pub mod rate_limiter;
pub mod resolver;
pub mod tx_store;
pub mod types;

pub use batch_writer::{BatchWriter, Blockchain, ReadResponse, ValueTimeLock};
pub use download::{Cas, CasReadOutcome, DownloadManager};
pub use error::{EngineError, Result};
pub use operation::Operation;
pub use processor::OperationProcessor;
pub use rate_limiter::OperationRateLimiter;
pub use resolver::{DidState, Resolver};
pub use tx_store::{
    InMemoryTransactionStore, ResolvedTransaction, Transaction, TransactionStore,
    UnresolvableTransaction,
};
pub use types::{OperationIndex, OperationTimestamp, OperationType, TransactionNumber, TransactionTime};
