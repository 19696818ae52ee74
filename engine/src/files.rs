//! Anchor/map/chunk file formats (spec §3, §4.6): the three CAS-stored files
//! a batch of operations is split into, plus the size-bound checks named in
//! spec §6's config table.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::operation::Operation;

/// One operation's header inside the anchor or map file: enough to locate
/// the operation's delta in the chunk file, reconstruct its identity and DAG
/// edge, and — for non-create operations — which prior operation it
/// revealed a commitment for. `operation_hash`/`previous_operation_hash`
/// round-trip an operation's DAG identity through the trilogy so the
/// observer can rebuild a multi-operation chain from anchor/map/chunk files
/// alone (spec §4.8 `downloadAndProcess`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationHeader {
    pub did_suffix: String,
    pub operation_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_operation_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reveal_value: Option<String>,
}

/// CAS-stored anchor file (spec §3): writer lock id, the map file's CAS
/// pointer, and a header per create/recover/deactivate operation queued in
/// this batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub writer_lock_id: Option<String>,
    pub map_file_uri: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub create_operations: Vec<OperationHeader>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recover_operations: Vec<OperationHeader>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deactivate_operations: Vec<OperationHeader>,
}

impl AnchorFile {
    #[must_use]
    pub fn operation_count(&self) -> usize {
        self.create_operations.len() + self.recover_operations.len() + self.deactivate_operations.len()
    }
}

/// CAS-stored map file (spec §3): the chunk file's CAS pointer and a header
/// per update operation queued in this batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapFile {
    pub chunk_file_uri: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub update_operations: Vec<OperationHeader>,
}

/// CAS-stored chunk file (spec §3): the deltas for create, recover, and
/// update operations, in the same relative order as the anchor/map file
/// headers reference them. Deactivates carry no delta.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkFile {
    pub deltas: Vec<serde_json::Value>,
}

/// Size bounds a CAS-stored file must be checked against before it is
/// trusted (spec §6 `maxAnchorFileSizeInBytes` / `maxMapFileSizeInBytes` /
/// `maxBatchFileSizeInBytes`).
pub fn check_size(label: &str, bytes: &[u8], max_bytes: usize) -> Result<()> {
    if bytes.len() > max_bytes {
        return Err(match label {
            "anchor" => EngineError::MalformedAnchorFile(format!(
                "{} bytes exceeds the {max_bytes} byte limit",
                bytes.len()
            )),
            "map" => EngineError::MalformedMapFile(format!(
                "{} bytes exceeds the {max_bytes} byte limit",
                bytes.len()
            )),
            _ => EngineError::MalformedChunkFile(format!(
                "{} bytes exceeds the {max_bytes} byte limit",
                bytes.len()
            )),
        });
    }
    Ok(())
}

pub fn parse_anchor_file(bytes: &[u8], max_bytes: usize) -> Result<AnchorFile> {
    check_size("anchor", bytes, max_bytes)?;
    serde_json::from_slice(bytes)
        .map_err(|e| EngineError::MalformedAnchorFile(e.to_string()))
}

pub fn parse_map_file(bytes: &[u8], max_bytes: usize) -> Result<MapFile> {
    check_size("map", bytes, max_bytes)?;
    serde_json::from_slice(bytes)
        .map_err(|e| EngineError::MalformedMapFile(e.to_string()))
}

pub fn parse_chunk_file(bytes: &[u8], max_bytes: usize) -> Result<ChunkFile> {
    check_size("chunk", bytes, max_bytes)?;
    serde_json::from_slice(bytes)
        .map_err(|e| EngineError::MalformedChunkFile(e.to_string()))
}

/// Splits a queued batch of operations into the anchor/map/chunk trilogy
/// (spec §4.6 steps 4-7), in preparation for CAS writes.
pub fn build_trilogy(
    operations: &[Operation],
    writer_lock_id: Option<String>,
) -> Result<(AnchorFile, MapFile, ChunkFile)> {
    let mut anchor = AnchorFile {
        writer_lock_id,
        ..AnchorFile::default()
    };
    let mut map = MapFile::default();
    let mut chunk = ChunkFile::default();

    for op in operations {
        let operation_hash = op.operation_hash().to_string();
        let previous_operation_hash = op.previous_operation_hash().map(str::to_string);

        match op {
            Operation::Create { did_suffix, delta, .. } => {
                anchor.create_operations.push(OperationHeader {
                    did_suffix: did_suffix.clone(),
                    operation_hash,
                    previous_operation_hash,
                    reveal_value: None,
                });
                chunk.deltas.push(delta.clone());
            }
            Operation::Recover {
                did_suffix,
                reveal_value,
                delta,
                ..
            } => {
                anchor.recover_operations.push(OperationHeader {
                    did_suffix: did_suffix.clone(),
                    operation_hash,
                    previous_operation_hash,
                    reveal_value: Some(reveal_value.clone()),
                });
                chunk.deltas.push(delta.clone());
            }
            Operation::Update {
                did_suffix,
                reveal_value,
                delta,
                ..
            } => {
                map.update_operations.push(OperationHeader {
                    did_suffix: did_suffix.clone(),
                    operation_hash,
                    previous_operation_hash,
                    reveal_value: Some(reveal_value.clone()),
                });
                chunk.deltas.push(delta.clone());
            }
            Operation::Deactivate {
                did_suffix,
                reveal_value,
                ..
            } => {
                anchor.deactivate_operations.push(OperationHeader {
                    did_suffix: did_suffix.clone(),
                    operation_hash,
                    previous_operation_hash,
                    reveal_value: Some(reveal_value.clone()),
                });
            }
        }
    }

    Ok((anchor, map, chunk))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Operation;

    #[test]
    fn trilogy_splits_operations_by_type_into_the_right_files() {
        let ops = vec![
            Operation::Create {
                did_suffix: "suffix-a".to_string(),
                operation_hash: "op-a".to_string(),
                signature: "sig-a".to_string(),
                delta: serde_json::json!({"replace": {"x": 1}}),
            },
            Operation::Update {
                did_suffix: "suffix-a".to_string(),
                operation_hash: "op-b".to_string(),
                previous_operation_hash: "op-a".to_string(),
                reveal_value: "reveal-1".to_string(),
                signature: "sig-b".to_string(),
                delta: serde_json::json!({"replace": {"x": 2}}),
            },
            Operation::Deactivate {
                did_suffix: "suffix-a".to_string(),
                operation_hash: "op-c".to_string(),
                previous_operation_hash: "op-b".to_string(),
                reveal_value: "reveal-2".to_string(),
                signature: "sig-c".to_string(),
            },
        ];

        let (anchor, map, chunk) = build_trilogy(&ops, Some("lock-1".to_string())).unwrap();

        assert_eq!(anchor.create_operations.len(), 1);
        assert_eq!(anchor.deactivate_operations.len(), 1);
        assert_eq!(map.update_operations.len(), 1);
        assert_eq!(chunk.deltas.len(), 2);
        assert_eq!(anchor.operation_count(), 2);
    }

    #[test]
    fn oversized_file_is_rejected_before_parsing() {
        let bytes = vec![0u8; 16];
        let err = parse_anchor_file(&bytes, 4).unwrap_err();
        assert!(matches!(err, EngineError::MalformedAnchorFile(_)));
    }
}
