//! Client-side mirror of the pool's incremental Merkle tree.
//!
//! Fixed depth 20, MiMC internal nodes, append-only in strictly ascending
//! leaf order — the same discipline the contract's `nextLeafIndex` counter
//! enforces. The client keeps the last 500 roots so proofs built against a
//! slightly stale root stay valid while the pool advances.

use std::collections::VecDeque;

use ark_bn254::Fr;

use crate::error::MerkleError;
use crate::field::{fr_from_bytes, keccak256, mimc2};

/// Tree depth fixed by the circuits.
pub const TREE_DEPTH: usize = 20;

/// Matches ROOT_HISTORY_SIZE in the pool contract.
pub const ROOT_HISTORY_SIZE: usize = 500;

/// The empty-leaf constant: keccak256("zdoge") reduced into the field.
pub fn zero_leaf() -> Fr {
    fr_from_bytes(&keccak256(b"zdoge"))
}

/// Sibling hashes and index bits for one leaf, tied to the root the tree
/// had when the path was extracted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MerklePath {
    pub leaf_index: u32,
    /// Sibling hash per level, leaf level first.
    pub siblings: Vec<Fr>,
    /// Bit decomposition of the index, leaf level first.
    /// `true` means the node is the right child at that level.
    pub path_bits: Vec<bool>,
    pub root: Fr,
}

/// Verify a path against its embedded root.
pub fn verify_path(leaf: Fr, path: &MerklePath) -> bool {
    let mut current = leaf;
    for (sibling, is_right) in path.siblings.iter().zip(&path.path_bits) {
        current = if *is_right {
            mimc2(*sibling, current)
        } else {
            mimc2(current, *sibling)
        };
    }
    current == path.root
}

/// An incremental Merkle tree mirroring the on-chain insertion logic.
#[derive(Clone, Debug)]
pub struct PoolTree {
    zeros: Vec<Fr>,
    filled_subtrees: Vec<Fr>,
    next_index: u32,
    roots: VecDeque<Fr>,
    leaves: Vec<Fr>,
}

impl Default for PoolTree {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolTree {
    pub fn new() -> Self {
        let mut zeros = Vec::with_capacity(TREE_DEPTH);
        zeros.push(zero_leaf());
        for i in 1..TREE_DEPTH {
            let z = zeros[i - 1];
            zeros.push(mimc2(z, z));
        }
        let filled_subtrees = zeros.clone();
        let top = zeros[TREE_DEPTH - 1];
        let mut roots = VecDeque::with_capacity(ROOT_HISTORY_SIZE);
        roots.push_back(mimc2(top, top));
        PoolTree {
            zeros,
            filled_subtrees,
            next_index: 0,
            roots,
            leaves: Vec::new(),
        }
    }

    /// Append a commitment at the next free index.
    pub fn insert(&mut self, commitment: Fr) -> Result<(u32, Fr), MerkleError> {
        let index = self.next_index;
        if u64::from(index) >= 1u64 << TREE_DEPTH {
            return Err(MerkleError::Full);
        }

        let mut current_index = index;
        let mut current_hash = commitment;
        for level in 0..TREE_DEPTH {
            if current_index % 2 == 0 {
                // left child: pair with the zero subtree on the right
                self.filled_subtrees[level] = current_hash;
                current_hash = mimc2(current_hash, self.zeros[level]);
            } else {
                // right child: pair with the filled subtree on the left
                current_hash = mimc2(self.filled_subtrees[level], current_hash);
            }
            current_index /= 2;
        }

        if self.roots.len() == ROOT_HISTORY_SIZE {
            self.roots.pop_front();
        }
        self.roots.push_back(current_hash);
        self.next_index = index + 1;
        self.leaves.push(commitment);
        Ok((index, current_hash))
    }

    pub fn root(&self) -> Fr {
        *self.roots.back().expect("roots never empty")
    }

    /// Known roots, newest first.
    pub fn known_roots(&self) -> impl Iterator<Item = Fr> + '_ {
        self.roots.iter().rev().copied()
    }

    pub fn is_known_root(&self, root: Fr) -> bool {
        self.roots.iter().any(|r| *r == root)
    }

    pub fn leaf_count(&self) -> u32 {
        self.next_index
    }

    pub fn leaf(&self, index: u32) -> Option<Fr> {
        self.leaves.get(index as usize).copied()
    }

    /// Path for a leaf against the current root.
    pub fn path(&self, leaf_index: u32) -> Result<MerklePath, MerkleError> {
        self.path_at(leaf_index, self.leaves.len() as u32)
    }

    /// Path for a leaf against the root the tree had `offset` insertions
    /// ago. Offset 0 is the current root. Used by the witness builders'
    /// stale-root fallback ladder.
    pub fn path_at_offset(&self, leaf_index: u32, offset: usize) -> Result<MerklePath, MerkleError> {
        let count = self
            .leaves
            .len()
            .checked_sub(offset)
            .ok_or_else(|| MerkleError::UnknownRoot(self.root()))?;
        self.path_at(leaf_index, count as u32)
    }

    /// Path for a leaf in the snapshot that contained exactly `leaf_count`
    /// leaves. The resulting root must still be inside the history window.
    fn path_at(&self, leaf_index: u32, leaf_count: u32) -> Result<MerklePath, MerkleError> {
        if leaf_index >= leaf_count || (leaf_count as usize) > self.leaves.len() {
            return Err(MerkleError::Unknown(leaf_index));
        }

        // rebuild only the occupied prefix of each level; everything to the
        // right of it is the zero subtree for that level
        let mut level: Vec<Fr> = self.leaves[..leaf_count as usize].to_vec();
        let mut siblings = Vec::with_capacity(TREE_DEPTH);
        let mut path_bits = Vec::with_capacity(TREE_DEPTH);
        let mut idx = leaf_index as usize;

        for depth in 0..TREE_DEPTH {
            let sibling_idx = idx ^ 1;
            let sibling = level.get(sibling_idx).copied().unwrap_or(self.zeros[depth]);
            siblings.push(sibling);
            path_bits.push(idx % 2 == 1);

            let next_len = level.len().div_ceil(2);
            let mut next = Vec::with_capacity(next_len);
            for pair in 0..next_len {
                let left = level[2 * pair];
                let right = level.get(2 * pair + 1).copied().unwrap_or(self.zeros[depth]);
                next.push(mimc2(left, right));
            }
            level = next;
            idx /= 2;
        }

        let root = level
            .first()
            .copied()
            .unwrap_or_else(|| mimc2(self.zeros[TREE_DEPTH - 1], self.zeros[TREE_DEPTH - 1]));
        if !self.is_known_root(root) {
            return Err(MerkleError::UnknownRoot(root));
        }
        Ok(MerklePath {
            leaf_index,
            siblings,
            path_bits,
            root,
        })
    }

    /// Replay a stream of `(leaf_index, commitment)` insertions from chain.
    ///
    /// Re-observations of leaves we already hold must match exactly; a gap
    /// or disagreement means the local mirror can no longer be trusted.
    pub fn replay<I>(&mut self, events: I) -> Result<(), MerkleError>
    where
        I: IntoIterator<Item = (u32, Fr)>,
    {
        for (index, commitment) in events {
            if index < self.next_index {
                if self.leaves[index as usize] != commitment {
                    return Err(MerkleError::LeafMismatch { index });
                }
                continue;
            }
            if index != self.next_index {
                return Err(MerkleError::Gap {
                    expected: self.next_index,
                    got: index,
                });
            }
            self.insert(commitment)?;
        }
        Ok(())
    }

    /// Replay and check the result against the latest on-chain root. This
    /// is also where an incompatible hasher (wrong MiMC constant set)
    /// fails fast: the very first root comparison diverges.
    pub fn reconcile<I>(&mut self, events: I, chain_root: Fr) -> Result<(), MerkleError>
    where
        I: IntoIterator<Item = (u32, Fr)>,
    {
        self.replay(events)?;
        let local = self.root();
        if local != chain_root {
            return Err(MerkleError::Desync {
                local,
                chain: chain_root,
            });
        }
        Ok(())
    }
}
