//! Balanced-subtree Merkle tree construction, receipts, and verification
//! (spec §4.2). Leaves are added one at a time into a row of slots indexed by
//! subtree height; whenever two same-height subtrees meet, they combine into
//! the next height up. This is the same incremental accumulator shape as a
//! Merkle mountain range, but folded into a single root rather than left as
//! a forest of peaks.

use sha2::{Digest, Sha256};

use crate::error::{CommonError, Result};

fn hash_leaf(value: &[u8]) -> [u8; 32] {
    Sha256::digest(value).into()
}

fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Which side a receipt's recorded sibling sat on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

/// One step of a Merkle proof: the sibling hash encountered while walking
/// from a leaf up to the root, and which side it sat on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptNode {
    pub side: Side,
    pub hash: [u8; 32],
}

/// A full inclusion proof for one leaf.
pub type Receipt = Vec<ReceiptNode>;

/// A subtree tracked while building the tree: its height (2^height leaves)
/// and its root hash.
#[derive(Debug, Clone)]
struct Subtree {
    height: u32,
    hash: [u8; 32],
}

/// A balanced-subtree Merkle tree over an ordered sequence of leaf values.
///
/// Construction keeps a row of subtrees indexed by height, combining two
/// equal-height subtrees (`left` = the existing one, `right` = the
/// newly-arrived one) into their parent whenever a slot collides, then
/// finalizes by folding the remaining subtrees smallest-to-largest with the
/// smallest on the right.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    root: [u8; 32],
    leaf_count: usize,
    receipts: Vec<Receipt>,
}

impl MerkleTree {
    /// Builds a tree over `values`, in order. Fails on an empty input: a
    /// Merkle root is not defined without at least one leaf.
    pub fn build<T: AsRef<[u8]>>(values: &[T]) -> Result<Self> {
        if values.is_empty() {
            return Err(CommonError::EmptyLeafSet);
        }

        // One receipt-in-progress per leaf: each entry accumulates the
        // sibling/side pairs as leaves combine upward.
        let mut receipts: Vec<Receipt> = vec![Vec::new(); values.len()];
        // Slots[h] holds, if occupied, the subtree of height h together with
        // the range of leaf indices it covers (for receipt bookkeeping).
        let mut slots: Vec<Option<(Subtree, std::ops::Range<usize>)>> = Vec::new();

        for (index, value) in values.iter().enumerate() {
            let mut current = Subtree {
                height: 0,
                hash: hash_leaf(value.as_ref()),
            };
            let mut current_range = index..index + 1;

            let mut height = 0usize;
            loop {
                if height >= slots.len() {
                    slots.push(None);
                }
                match slots[height].take() {
                    None => {
                        slots[height] = Some((current, current_range));
                        break;
                    }
                    Some((existing, existing_range)) => {
                        // existing = left (arrived earlier), current = right.
                        for leaf in existing_range.clone() {
                            receipts[leaf].push(ReceiptNode {
                                side: Side::Right,
                                hash: current.hash,
                            });
                        }
                        for leaf in current_range.clone() {
                            receipts[leaf].push(ReceiptNode {
                                side: Side::Left,
                                hash: existing.hash,
                            });
                        }

                        let combined = Subtree {
                            height: existing.height + 1,
                            hash: hash_pair(&existing.hash, &current.hash),
                        };
                        let combined_range = existing_range.start..current_range.end;

                        current = combined;
                        current_range = combined_range;
                        height += 1;
                    }
                }
            }
        }

        // Finalize: fold whatever is left in the slots, smallest height
        // first, with the smaller subtree always becoming the *right* child
        // of the running accumulator.
        let mut remaining: Vec<(Subtree, std::ops::Range<usize>)> =
            slots.into_iter().flatten().collect();
        remaining.sort_by_key(|(subtree, _)| subtree.height);

        let mut iter = remaining.into_iter();
        let (mut acc, mut acc_range) = iter
            .next()
            .expect("at least one leaf guarantees at least one occupied slot");

        for (next, next_range) in iter {
            // acc so far is the *smaller* (or equal) accumulated subtree;
            // per spec it becomes the right child of the new parent.
            for leaf in acc_range.clone() {
                receipts[leaf].push(ReceiptNode {
                    side: Side::Left,
                    hash: next.hash,
                });
            }
            for leaf in next_range.clone() {
                receipts[leaf].push(ReceiptNode {
                    side: Side::Right,
                    hash: acc.hash,
                });
            }

            acc = Subtree {
                height: next.height.max(acc.height) + 1,
                hash: hash_pair(&next.hash, &acc.hash),
            };
            acc_range = next_range.start.min(acc_range.start)..next_range.end.max(acc_range.end);
        }

        Ok(Self {
            root: acc.hash,
            leaf_count: values.len(),
            receipts,
        })
    }

    #[must_use]
    pub fn root(&self) -> [u8; 32] {
        self.root
    }

    #[must_use]
    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    /// Returns the inclusion receipt for the leaf at `index`.
    #[must_use]
    pub fn receipt(&self, index: usize) -> Option<&Receipt> {
        self.receipts.get(index)
    }
}

/// Re-derives a root from a leaf value and its receipt, and compares it to
/// `expected_root`.
#[must_use]
pub fn verify(value: &[u8], receipt: &Receipt, expected_root: [u8; 32]) -> bool {
    let mut acc = hash_leaf(value);
    for node in receipt {
        acc = match node.side {
            Side::Left => hash_pair(&node.hash, &acc),
            Side::Right => hash_pair(&acc, &node.hash),
        };
    }
    acc == expected_root
}
