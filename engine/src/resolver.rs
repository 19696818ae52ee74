//! Document resolution (spec §4.7 `resolve`): walks a DID's `nextVersion`
//! chain to its last Valid tip and applies each operation's delta in order.
//!
//! spec.md is silent on the document's concrete shape (it scopes out CAS and
//! document schema); this module fixes one per SPEC_FULL.md §3: a small
//! patch-op set applied to a JSON object, with key rotation modeled as each
//! delta declaring the public key authorized to sign the *next*
//! update/recover operation (see `processor` for how that authorization is
//! checked against an operation's signature).

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::operation::Operation;
use crate::processor::{OperationProcessor, OperationStatus};

/// One patch applied to a [`DidState`]'s document during resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum PatchAction {
    Replace { document: serde_json::Value },
    AddPublicKey { id: String, public_key_hex: String },
    RemovePublicKey { id: String },
    AddService { id: String, endpoint: String },
    RemoveService { id: String },
}

/// The typed shape of an [`Operation`]'s delta payload (spec §3 `delta`):
/// the patches to apply, plus the public keys authorized to sign the next
/// update and next recover/deactivate operation in this DID's chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delta {
    pub patches: Vec<PatchAction>,
    pub update_key: String,
    pub recovery_key: String,
}

/// The resolver's return value (SPEC_FULL.md §3): the reconstructed document
/// plus the bookkeeping a real Sidetree-style resolver reports alongside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DidState {
    pub did: String,
    pub document: serde_json::Value,
    pub update_commitment: String,
    pub recovery_commitment: String,
    pub last_operation_hash: String,
    pub deactivated: bool,
}

fn apply_patch(document: &mut serde_json::Value, patch: &PatchAction) {
    if !document.is_object() {
        *document = serde_json::json!({});
    }
    let map = document.as_object_mut().expect("forced to an object above");

    match patch {
        PatchAction::Replace { document: replacement } => {
            *document = replacement.clone();
        }
        PatchAction::AddPublicKey { id, public_key_hex } => {
            let keys = map
                .entry("publicKeys")
                .or_insert_with(|| serde_json::json!({}))
                .as_object_mut()
                .expect("publicKeys is always an object in documents this resolver produces");
            keys.insert(id.clone(), serde_json::json!(public_key_hex));
        }
        PatchAction::RemovePublicKey { id } => {
            if let Some(keys) = map.get_mut("publicKeys").and_then(|v| v.as_object_mut()) {
                keys.remove(id);
            }
        }
        PatchAction::AddService { id, endpoint } => {
            let services = map
                .entry("services")
                .or_insert_with(|| serde_json::json!({}))
                .as_object_mut()
                .expect("services is always an object in documents this resolver produces");
            services.insert(id.clone(), serde_json::json!(endpoint));
        }
        PatchAction::RemoveService { id } => {
            if let Some(services) = map.get_mut("services").and_then(|v| v.as_object_mut()) {
                services.remove(id);
            }
        }
    }
}

/// Reconstructs a DID's current state by walking `nextVersion` from its
/// Create operation to the last Valid tip, applying each delta in order
/// (spec §4.7). `did_suffix` is the Create operation's hash (spec §4.1: the
/// DID unique suffix *is* that multihash).
pub fn resolve(processor: &OperationProcessor, did_suffix: &str) -> Result<DidState> {
    let create_info = processor
        .info(did_suffix)
        .ok_or_else(|| EngineError::DidNotFound(did_suffix.to_string()))?;

    if create_info.status != OperationStatus::Valid {
        return Err(EngineError::DidNotFound(did_suffix.to_string()));
    }

    let mut document = serde_json::json!({});
    let mut update_commitment = String::new();
    let mut recovery_commitment = String::new();
    let mut deactivated = false;
    let mut current_hash = did_suffix.to_string();
    let mut last_hash = current_hash.clone();

    loop {
        let op = processor
            .operation(&current_hash)
            .ok_or_else(|| EngineError::DidNotFound(did_suffix.to_string()))?;

        match op {
            Operation::Deactivate { .. } => {
                deactivated = true;
                last_hash = current_hash.clone();
                break;
            }
            _ => {
                let raw_delta = op.delta().cloned().ok_or_else(|| {
                    EngineError::MalformedOperation(format!(
                        "operation {current_hash} is not a Deactivate but carries no delta"
                    ))
                })?;
                let delta: Delta = serde_json::from_value(raw_delta)?;
                for patch in &delta.patches {
                    apply_patch(&mut document, patch);
                }
                update_commitment = delta.update_key;
                recovery_commitment = delta.recovery_key;
            }
        }

        last_hash = current_hash.clone();
        match processor.next_version(&current_hash) {
            Some(next) => current_hash = next.to_string(),
            None => break,
        }
    }

    Ok(DidState {
        did: did_suffix.to_string(),
        document,
        update_commitment,
        recovery_commitment,
        last_operation_hash: last_hash,
        deactivated,
    })
}

/// A thin struct wrapper so call sites can write `Resolver::resolve(&processor, suffix)`
/// in the teacher's style of grouping a stateless operation under a unit type.
pub struct Resolver;

impl Resolver {
    pub fn resolve(processor: &OperationProcessor, did_suffix: &str) -> Result<DidState> {
        resolve(processor, did_suffix)
    }
}
