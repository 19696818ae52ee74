use thiserror::Error;

/// Errors shared by the multihash, Merkle-tree, and canonical-JSON helpers.
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("unsupported hash algorithm: multihash code {0}")]
    UnsupportedHashAlgorithm(u64),

    #[error("malformed multihash: {0}")]
    MalformedMultihash(String),

    #[error("base encoding error: {0}")]
    EncodingError(String),

    #[error("Merkle receipt verification failed")]
    InvalidMerkleReceipt,

    #[error("cannot build a Merkle tree from an empty leaf set")]
    EmptyLeafSet,

    #[error("JSON canonicalization error: {0}")]
    CanonicalizationError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CommonError>;
