//! Operation parsing, identity, and signature validation (spec §4.1, §4.7 V2).
//!
//! An [`Operation`] carries its own identity hash and signature but is
//! agnostic to where it sits in a DID's version DAG — that bookkeeping lives
//! in [`crate::processor`].

use ed25519_dalek::{PublicKey, Signature, Verifier};
use serde::{Deserialize, Serialize};

use common::multihash::{self, Encoding};

use crate::error::{EngineError, Result};
use crate::types::OperationType;

/// One parsed Sidetree-style operation (spec §3). `delta` is the patch
/// payload applied during resolution; deactivates carry none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Operation {
    Create {
        did_suffix: String,
        operation_hash: String,
        signature: String,
        delta: serde_json::Value,
    },
    Update {
        did_suffix: String,
        operation_hash: String,
        previous_operation_hash: String,
        reveal_value: String,
        signature: String,
        delta: serde_json::Value,
    },
    Recover {
        did_suffix: String,
        operation_hash: String,
        previous_operation_hash: String,
        reveal_value: String,
        signature: String,
        delta: serde_json::Value,
    },
    Deactivate {
        did_suffix: String,
        operation_hash: String,
        previous_operation_hash: String,
        reveal_value: String,
        signature: String,
    },
}

impl Operation {
    #[must_use]
    pub fn did_suffix(&self) -> &str {
        match self {
            Self::Create { did_suffix, .. }
            | Self::Update { did_suffix, .. }
            | Self::Recover { did_suffix, .. }
            | Self::Deactivate { did_suffix, .. } => did_suffix,
        }
    }

    #[must_use]
    pub fn operation_hash(&self) -> &str {
        match self {
            Self::Create { operation_hash, .. }
            | Self::Update { operation_hash, .. }
            | Self::Recover { operation_hash, .. }
            | Self::Deactivate { operation_hash, .. } => operation_hash,
        }
    }

    /// Absent only for Create (spec §3).
    #[must_use]
    pub fn previous_operation_hash(&self) -> Option<&str> {
        match self {
            Self::Create { .. } => None,
            Self::Update {
                previous_operation_hash,
                ..
            }
            | Self::Recover {
                previous_operation_hash,
                ..
            }
            | Self::Deactivate {
                previous_operation_hash,
                ..
            } => Some(previous_operation_hash),
        }
    }

    #[must_use]
    pub fn delta(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Create { delta, .. } | Self::Update { delta, .. } | Self::Recover { delta, .. } => {
                Some(delta)
            }
            Self::Deactivate { .. } => None,
        }
    }

    #[must_use]
    pub fn op_type(&self) -> OperationType {
        match self {
            Self::Create { .. } => OperationType::Create,
            Self::Update { .. } => OperationType::Update,
            Self::Recover { .. } => OperationType::Recover,
            Self::Deactivate { .. } => OperationType::Deactivate,
        }
    }

    #[must_use]
    pub fn signature(&self) -> &str {
        match self {
            Self::Create { signature, .. }
            | Self::Update { signature, .. }
            | Self::Recover { signature, .. }
            | Self::Deactivate { signature, .. } => signature,
        }
    }

    /// The bytes the signature was computed over: the canonical JSON of the
    /// operation with the `signature` field itself removed.
    fn signing_payload(&self) -> Result<Vec<u8>> {
        let mut value = serde_json::to_value(self)?;
        if let serde_json::Value::Object(map) = &mut value {
            map.remove("signature");
        }
        common::canonical::canonicalize(&value).map_err(EngineError::from)
    }

    /// Verifies (V2): the operation's signature against a public key resolved
    /// from the DID's prior state.
    pub fn verify_signature(&self, public_key_bytes: &[u8; 32]) -> Result<bool> {
        let payload = self.signing_payload()?;
        let signature_bytes = hex::decode(self.signature())
            .map_err(|e| EngineError::MalformedOperation(format!("signature is not hex: {e}")))?;
        let signature = Signature::from_bytes(&signature_bytes)
            .map_err(|e| EngineError::MalformedOperation(format!("malformed signature: {e}")))?;
        let public_key = PublicKey::from_bytes(public_key_bytes)
            .map_err(|e| EngineError::MalformedOperation(format!("malformed public key: {e}")))?;
        Ok(public_key.verify(&payload, &signature).is_ok())
    }
}

/// Parses one operation out of its JSON encoding (spec §4.7 input to
/// `processBatch`, produced from a chunk-file delta plus its anchor/map-file
/// header).
pub fn parse_operation(bytes: &[u8]) -> Result<Operation> {
    serde_json::from_slice(bytes).map_err(|e| EngineError::MalformedOperation(e.to_string()))
}

/// Computes the multihash identity of a Create operation's initial encoded
/// document payload — the DID unique suffix (spec §4.1, §3).
pub fn compute_create_identity(delta: &serde_json::Value, encoding: Encoding) -> Result<String> {
    let canonical = common::canonical::canonicalize(delta)?;
    multihash::hash_and_encode(&canonical, encoding).map_err(EngineError::from)
}

/// Computes the multihash identity of a non-Create operation's full encoded
/// buffer (spec §4.1, §3).
pub fn compute_non_create_identity(operation_bytes: &[u8], encoding: Encoding) -> Result<String> {
    multihash::hash_and_encode(operation_bytes, encoding).map_err(EngineError::from)
}

#[must_use]
pub fn default_encoding() -> Encoding {
    Encoding::Base58Btc
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::Keypair;
    use rand::rngs::OsRng;

    fn keypair() -> Keypair {
        Keypair::generate(&mut OsRng)
    }

    fn signed_create(keypair: &Keypair, delta: serde_json::Value) -> Operation {
        let mut op = Operation::Create {
            did_suffix: "placeholder".to_string(),
            operation_hash: "placeholder".to_string(),
            signature: String::new(),
            delta,
        };
        let payload = op.signing_payload().unwrap();
        let signature = {
            use ed25519_dalek::Signer;
            keypair.sign(&payload)
        };
        if let Operation::Create { signature: s, .. } = &mut op {
            *s = hex::encode(signature.to_bytes());
        }
        op
    }

    #[test]
    fn valid_signature_verifies() {
        let kp = keypair();
        let op = signed_create(&kp, serde_json::json!({"replace": {"a": 1}}));
        assert!(op.verify_signature(&kp.public.to_bytes()).unwrap());
    }

    #[test]
    fn signature_does_not_verify_under_a_different_key() {
        let kp = keypair();
        let other = keypair();
        let op = signed_create(&kp, serde_json::json!({"replace": {"a": 1}}));
        assert!(!op.verify_signature(&other.public.to_bytes()).unwrap());
    }

    #[test]
    fn create_identity_is_stable_under_key_reordering() {
        let a = serde_json::json!({"b": 1, "a": 2});
        let b = serde_json::json!({"a": 2, "b": 1});
        assert_eq!(
            compute_create_identity(&a, Encoding::Base58Btc).unwrap(),
            compute_create_identity(&b, Encoding::Base58Btc).unwrap()
        );
    }

    #[test]
    fn previous_operation_hash_is_absent_only_for_create() {
        let kp = keypair();
        let create = signed_create(&kp, serde_json::json!({}));
        assert!(create.previous_operation_hash().is_none());

        let update = Operation::Update {
            did_suffix: "suffix".to_string(),
            operation_hash: "op".to_string(),
            previous_operation_hash: "parent".to_string(),
            reveal_value: "reveal".to_string(),
            signature: String::new(),
            delta: serde_json::json!({}),
        };
        assert_eq!(update.previous_operation_hash(), Some("parent"));
    }
}
