//! The operation processor and version DAG (spec §4.7): the heart of the
//! node. Maintains `opHashToInfo`, `nextVersion`, and `waitingDescendants`
//! for every DID this node has observed operations for, enforcing validity
//! rules V1-V5 and supporting fork-safe rollback on reorg.
//!
//! Key rotation (V2 "signature verifies against the public key resolved from
//! the chain so far") is modeled without replaying full document state: each
//! operation's delta explicitly names the public key authorized to sign the
//! *next* update operation and the *next* recover/deactivate operation
//! (`resolver::Delta::update_key` / `recovery_key`). A child operation's
//! signature is checked against whichever of its parent's two keys matches
//! its own type. Deactivate has no delta and so establishes neither key,
//! which is exactly what makes it a terminal node (spec §9 open question iii)
//! — nothing can ever validate against it.

use std::collections::HashMap;

use tracing::{debug, trace, warn};

use crate::error::{EngineError, Result};
use crate::operation::Operation;
use crate::resolver::Delta;
use crate::types::{OperationTimestamp, OperationType, TransactionNumber};

/// An operation's place in the validity lattice (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Unvalidated,
    Valid,
    Invalid,
}

/// The processor's per-hash record (spec §3 `OperationInfo`).
#[derive(Debug, Clone)]
pub struct OperationInfo {
    pub batch_file_hash: String,
    pub op_type: OperationType,
    pub timestamp: OperationTimestamp,
    pub parent: Option<String>,
    pub status: OperationStatus,
    pub missing_ancestor: Option<String>,
    /// Public key this operation authorizes for the next Update, once Valid.
    pub update_key: Option<String>,
    /// Public key this operation authorizes for the next Recover/Deactivate,
    /// once Valid. `None` on a Valid Deactivate (spec §9 open question iii).
    pub recovery_key: Option<String>,
}

fn hex_to_public_key(hex_key: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_key)
        .map_err(|e| EngineError::OperationSignatureInvalid(format!("malformed key: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| EngineError::OperationSignatureInvalid("public key is not 32 bytes".to_string()))
}

fn parse_delta(op: &Operation) -> Option<Delta> {
    op.delta().and_then(|d| serde_json::from_value(d.clone()).ok())
}

/// The per-DID operation DAG (spec §4.7). A single `OperationProcessor`
/// instance spans every DID this node has ever seen an operation for, keyed
/// by operation hash — DIDs are not partitioned into separate DAG instances
/// since the hash keyspace already prevents cross-DID collisions.
#[derive(Debug, Default)]
pub struct OperationProcessor {
    op_hash_to_info: HashMap<String, OperationInfo>,
    operations_by_hash: HashMap<String, Operation>,
    next_version: HashMap<String, String>,
    waiting_descendants: HashMap<String, Vec<String>>,
}

impl OperationProcessor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn info(&self, op_hash: &str) -> Option<&OperationInfo> {
        self.op_hash_to_info.get(op_hash)
    }

    #[must_use]
    pub fn operation(&self, op_hash: &str) -> Option<&Operation> {
        self.operations_by_hash.get(op_hash)
    }

    #[must_use]
    pub fn next_version(&self, op_hash: &str) -> Option<&str> {
        self.next_version.get(op_hash).map(String::as_str)
    }

    /// Processes a batch of operations from one transaction's chunk file, in
    /// input order (spec §4.7 `processBatch`). Each operation is assigned a
    /// timestamp of `(transaction_number, index-in-batch)`.
    pub fn process_batch(
        &mut self,
        batch_file_hash: &str,
        transaction_number: TransactionNumber,
        operations: Vec<Operation>,
    ) {
        for (index, op) in operations.into_iter().enumerate() {
            let timestamp = OperationTimestamp::new(transaction_number, index as u32);
            self.process_one(op, batch_file_hash, timestamp);
        }
    }

    fn process_one(&mut self, op: Operation, batch_file_hash: &str, timestamp: OperationTimestamp) {
        let op_hash = op.operation_hash().to_string();

        if let Some(existing) = self.op_hash_to_info.get(&op_hash) {
            if existing.timestamp <= timestamp {
                debug!(%op_hash, "dropping duplicate/later arrival of an already-known operation");
                return;
            }
        }

        let parent = op.previous_operation_hash().map(str::to_string);
        let info = OperationInfo {
            batch_file_hash: batch_file_hash.to_string(),
            op_type: op.op_type(),
            timestamp,
            parent: parent.clone(),
            status: OperationStatus::Unvalidated,
            missing_ancestor: None,
            update_key: None,
            recovery_key: None,
        };

        self.operations_by_hash.insert(op_hash.clone(), op);
        self.op_hash_to_info.insert(op_hash.clone(), info);

        match parent {
            None => self.validate_create(&op_hash),
            Some(parent_hash) => self.validate_non_create(&op_hash, &parent_hash),
        }

        self.drain_waiting(&op_hash);
    }

    fn validate_create(&mut self, op_hash: &str) {
        let op = self.operations_by_hash.get(op_hash).expect("just inserted");
        let parsed = parse_delta(op);

        let signature_ok = parsed.as_ref().is_some_and(|delta| {
            hex_to_public_key(&delta.recovery_key)
                .and_then(|key| op.verify_signature(&key))
                .unwrap_or(false)
        });

        let info = self.op_hash_to_info.get_mut(op_hash).expect("just inserted");
        if signature_ok {
            let delta = parsed.expect("signature_ok implies parsed delta");
            info.update_key = Some(delta.update_key);
            info.recovery_key = Some(delta.recovery_key);
            info.status = OperationStatus::Valid;
        } else {
            warn!(%op_hash, "create operation signature invalid");
            info.status = OperationStatus::Invalid;
        }
    }

    fn validate_non_create(&mut self, op_hash: &str, parent_hash: &str) {
        let parent_status = self.op_hash_to_info.get(parent_hash).map(|i| i.status);

        match parent_status {
            None => {
                // (a) parent unknown.
                self.op_hash_to_info.get_mut(op_hash).expect("just inserted").missing_ancestor =
                    Some(parent_hash.to_string());
                self.waiting_descendants
                    .entry(parent_hash.to_string())
                    .or_default()
                    .push(op_hash.to_string());
            }
            Some(OperationStatus::Unvalidated) => {
                // (b) parent itself still awaiting an ancestor.
                let inherited = self.op_hash_to_info[parent_hash].missing_ancestor.clone();
                self.op_hash_to_info.get_mut(op_hash).expect("just inserted").missing_ancestor =
                    inherited.clone();
                if let Some(ancestor) = inherited {
                    self.waiting_descendants.entry(ancestor).or_default().push(op_hash.to_string());
                }
            }
            Some(OperationStatus::Invalid) => {
                // (c) Invalid-parent => Invalid.
                self.op_hash_to_info.get_mut(op_hash).expect("just inserted").status =
                    OperationStatus::Invalid;
            }
            Some(OperationStatus::Valid) => {
                // (d) the interesting case: signature, ordering, sibling tie-break.
                self.validate_against_valid_parent(op_hash, parent_hash);
            }
        }
    }

    fn validate_against_valid_parent(&mut self, op_hash: &str, parent_hash: &str) {
        let op = self.operations_by_hash.get(op_hash).expect("just inserted").clone();
        let parent_info = self.op_hash_to_info.get(parent_hash).expect("checked Valid above").clone();
        let op_timestamp = self.op_hash_to_info[op_hash].timestamp;

        // V5: parent strictly precedes child.
        let ordering_ok = parent_info.timestamp < op_timestamp;

        let authorized_key = match op.op_type() {
            OperationType::Update => parent_info.update_key.clone(),
            OperationType::Recover | OperationType::Deactivate => parent_info.recovery_key.clone(),
            OperationType::Create => unreachable!("Create operations have no parent"),
        };

        let signature_ok = ordering_ok
            && authorized_key
                .as_deref()
                .and_then(|key| hex_to_public_key(key).ok())
                .is_some_and(|key| op.verify_signature(&key).unwrap_or(false));

        if !signature_ok {
            trace!(%op_hash, "operation fails signature/ordering validation against its parent");
            self.op_hash_to_info.get_mut(op_hash).expect("just inserted").status = OperationStatus::Invalid;
            return;
        }

        // V3: sibling tie-break on (transactionNumber, operationIndex) ascending.
        match self.next_version.get(parent_hash).cloned() {
            None => {
                self.next_version.insert(parent_hash.to_string(), op_hash.to_string());
                self.mark_valid(op_hash, &op);
            }
            Some(earliest_sibling) => {
                let earliest_timestamp = self.op_hash_to_info[&earliest_sibling].timestamp;
                if earliest_timestamp <= op_timestamp {
                    self.op_hash_to_info.get_mut(op_hash).expect("just inserted").status =
                        OperationStatus::Invalid;
                } else {
                    debug!(
                        %op_hash, displaced = %earliest_sibling,
                        "earlier-timestamped sibling displaces the previously Valid chain"
                    );
                    self.invalidate_chain_from(&earliest_sibling);
                    self.next_version.insert(parent_hash.to_string(), op_hash.to_string());
                    self.mark_valid(op_hash, &op);
                }
            }
        }
    }

    fn mark_valid(&mut self, op_hash: &str, op: &Operation) {
        let parsed = parse_delta(op);
        let info = self.op_hash_to_info.get_mut(op_hash).expect("just inserted");
        info.status = OperationStatus::Valid;
        if let Some(delta) = parsed {
            info.update_key = Some(delta.update_key);
            info.recovery_key = Some(delta.recovery_key);
        }
    }

    /// Walks `nextVersion` forward from `start_hash`, invalidating every
    /// descendant and dropping its `nextVersion` link (spec §4.7 V3
    /// displacement and §4.7 `rollback`'s Valid branch).
    fn invalidate_chain_from(&mut self, start_hash: &str) {
        let mut current = Some(start_hash.to_string());
        while let Some(hash) = current {
            let next = self.next_version.remove(&hash);
            if let Some(info) = self.op_hash_to_info.get_mut(&hash) {
                info.status = OperationStatus::Invalid;
                info.update_key = None;
                info.recovery_key = None;
            }
            current = next;
        }
    }

    /// After `op_hash` settles into Valid or Invalid, re-drives every
    /// operation that was waiting directly on it (spec §4.7: "drain
    /// waitingDescendants[opHash] in recorded order").
    fn drain_waiting(&mut self, op_hash: &str) {
        let settled = matches!(
            self.op_hash_to_info.get(op_hash).map(|i| i.status),
            Some(OperationStatus::Valid) | Some(OperationStatus::Invalid)
        );
        if !settled {
            return;
        }

        let Some(waiting) = self.waiting_descendants.remove(op_hash) else {
            return;
        };

        for descendant_hash in waiting {
            let Some(parent_hash) = self.op_hash_to_info.get(&descendant_hash).and_then(|i| i.parent.clone())
            else {
                continue;
            };
            if let Some(info) = self.op_hash_to_info.get_mut(&descendant_hash) {
                info.missing_ancestor = None;
            }
            self.validate_non_create(&descendant_hash, &parent_hash);
            self.drain_waiting(&descendant_hash);
        }
    }

    /// Reverts every operation anchored at or after `transaction_number`
    /// (spec §4.7 `rollback`; the observer calls this with
    /// `best_known_valid.transaction_number + 1`, fixing spec §9 open
    /// question ii at "strictly greater than best-known-valid").
    pub fn rollback(&mut self, transaction_number: TransactionNumber) {
        let to_remove: Vec<String> = self
            .op_hash_to_info
            .iter()
            .filter(|(_, info)| info.timestamp.transaction_number >= transaction_number)
            .map(|(hash, _)| hash.clone())
            .collect();

        for hash in &to_remove {
            let info = self.op_hash_to_info[hash].clone();
            match info.status {
                OperationStatus::Valid => {
                    if let Some(parent) = &info.parent {
                        self.next_version.remove(parent);
                    }
                }
                OperationStatus::Unvalidated => {
                    if let Some(ancestor) = &info.missing_ancestor {
                        if let Some(list) = self.waiting_descendants.get_mut(ancestor) {
                            list.retain(|h| h != hash);
                        }
                    }
                }
                OperationStatus::Invalid => {}
            }
        }

        for hash in &to_remove {
            self.op_hash_to_info.remove(hash);
            self.operations_by_hash.remove(hash);
            self.next_version.remove(hash);
        }
    }
}
