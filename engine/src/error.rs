use thiserror::Error;

use common::CommonError;

/// Error kinds for the operation DAG, rate limiter, batch writer, and
/// transaction store contract (spec §7).
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Common(#[from] CommonError),

    #[error("CAS entry not found for hash {0}")]
    CasNotFound(String),

    #[error("CAS entry for hash {0} exceeds the maximum allowed size")]
    CasTooLarge(String),

    #[error("malformed anchor file: {0}")]
    MalformedAnchorFile(String),

    #[error("malformed map file: {0}")]
    MalformedMapFile(String),

    #[error("malformed chunk file: {0}")]
    MalformedChunkFile(String),

    #[error("operation signature invalid for operation {0}")]
    OperationSignatureInvalid(String),

    #[error("malformed operation: {0}")]
    MalformedOperation(String),

    #[error("no queued operations are available to batch")]
    EmptyBatch,

    #[error("blockchain write failed: {0}")]
    BlockchainWriteFailed(String),

    #[error("blockchain read failed: {0}")]
    BlockchainReadFailed(String),

    #[error("blockchain reported an invalid transaction number or time hash: {0}")]
    InvalidTransactionNumberOrTimeHash(String),

    #[error("no create operation is known for DID {0}")]
    DidNotFound(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
