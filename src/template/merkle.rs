//! Merkle tree helpers
//!
//! Trees are built with double SHA-256; a level with an odd number of nodes
//! duplicates its last node. The coinbase occupies leaf index 0, so a
//! session can recompute the root from its spliced coinbase plus the
//! template's precomputed branch path.

use sha2::{Digest, Sha256};

/// Double SHA-256 of a byte string.
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

/// Double SHA-256 of two concatenated nodes.
pub fn double_sha256_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut combined = [0u8; 64];
    combined[..32].copy_from_slice(left);
    combined[32..].copy_from_slice(right);
    double_sha256(&combined)
}

/// Merkle root over a full leaf set.
pub fn merkle_root(leaves: &[[u8; 32]]) -> [u8; 32] {
    match leaves.len() {
        0 => [0u8; 32],
        1 => leaves[0],
        _ => {
            let mut level = leaves.to_vec();
            while level.len() > 1 {
                let mut next = Vec::with_capacity((level.len() + 1) / 2);
                for chunk in level.chunks(2) {
                    let left = &chunk[0];
                    let right = if chunk.len() == 2 { &chunk[1] } else { &chunk[0] };
                    next.push(double_sha256_pair(left, right));
                }
                level = next;
            }
            level[0]
        }
    }
}

/// Branch path for the coinbase (leaf index 0), computed from the
/// non-coinbase transaction ids alone.
///
/// At every level the coinbase-side node stays at index 0, so the sibling to
/// record is always the first node of the remaining transaction side; the
/// rest of that side pairs up (duplicating its last node when odd) to form
/// the next level.
pub fn coinbase_branches(tx_ids: &[[u8; 32]]) -> Vec<[u8; 32]> {
    let mut branches = Vec::new();
    let mut level: Vec<[u8; 32]> = tx_ids.to_vec();
    while !level.is_empty() {
        branches.push(level[0]);
        let rest = &level[1..];
        let mut next = Vec::with_capacity((rest.len() + 1) / 2);
        for chunk in rest.chunks(2) {
            let left = &chunk[0];
            let right = if chunk.len() == 2 { &chunk[1] } else { &chunk[0] };
            next.push(double_sha256_pair(left, right));
        }
        level = next;
    }
    branches
}

/// Fold a coinbase transaction id up the branch path to the root.
pub fn fold_branches(coinbase_id: [u8; 32], branches: &[[u8; 32]]) -> [u8; 32] {
    let mut node = coinbase_id;
    for branch in branches {
        node = double_sha256_pair(&node, branch);
    }
    node
}
