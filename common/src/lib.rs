pub mod canonical;
pub mod error;
pub mod merkle;
pub mod multihash;

pub use error::{CommonError, Result};
pub use merkle::MerkleTree;
pub use multihash::{Encoding, SHA2_256};
