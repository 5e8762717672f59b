//! # Merkle Allow-List Commitments
//!
//! Builds the root and per-address proofs a drop contract checks with
//! OpenZeppelin's `MerkleProof.verify`:
//!
//! - leaf = `keccak256(abi.encodePacked(address))` (the 20 raw bytes)
//! - node = `keccak256(min(a, b) ++ max(a, b))` (sorted pairs)
//! - an unpaired node is carried up unchanged, never duplicated
//!
//! Leaves are sorted before the tree is laid out, so the same set always
//! yields the same root regardless of input order. Any change to the set
//! requires a full rebuild; proofs depend on the whole sibling path.

use ethers::types::{Address, H256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Root returned for an empty allow-list.
pub const ZERO_ROOT: H256 = H256::zero();

/// Root plus the proof of every member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleCommitment {
    pub root: H256,
    pub proofs: BTreeMap<Address, Vec<H256>>,
}

impl MerkleCommitment {
    pub fn empty() -> Self {
        Self {
            root: ZERO_ROOT,
            proofs: BTreeMap::new(),
        }
    }

    pub fn proof(&self, address: &Address) -> Option<&[H256]> {
        self.proofs.get(address).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.proofs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proofs.is_empty()
    }

    /// Re-verify every stored proof against the stored root.
    pub fn is_consistent(&self) -> bool {
        if self.proofs.is_empty() {
            return self.root == ZERO_ROOT;
        }
        self.proofs
            .iter()
            .all(|(address, proof)| verify(address, self.root, proof))
    }
}

pub fn leaf_hash(address: &Address) -> H256 {
    H256::from(keccak256(address.as_bytes()))
}

pub fn hash_pair(a: H256, b: H256) -> H256 {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(lo.as_bytes());
    buf[32..].copy_from_slice(hi.as_bytes());
    H256::from(keccak256(buf))
}

/// Build the commitment for a set of addresses.
pub fn build(addresses: &BTreeSet<Address>) -> MerkleCommitment {
    if addresses.is_empty() {
        return MerkleCommitment::empty();
    }

    let mut leaves: Vec<(H256, Address)> = addresses
        .iter()
        .map(|address| (leaf_hash(address), *address))
        .collect();
    leaves.sort();

    let mut levels: Vec<Vec<H256>> = vec![leaves.iter().map(|(leaf, _)| *leaf).collect()];
    while levels[levels.len() - 1].len() > 1 {
        let current = &levels[levels.len() - 1];
        let next: Vec<H256> = current
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => hash_pair(*left, *right),
                [single] => *single,
                _ => unreachable!("chunks(2) yields one or two nodes"),
            })
            .collect();
        levels.push(next);
    }

    let root = levels[levels.len() - 1][0];

    let proofs = leaves
        .iter()
        .enumerate()
        .map(|(index, (_, address))| (*address, proof_at(&levels, index)))
        .collect();

    MerkleCommitment { root, proofs }
}

fn proof_at(levels: &[Vec<H256>], mut index: usize) -> Vec<H256> {
    let mut proof = Vec::new();
    for level in &levels[..levels.len() - 1] {
        let sibling = index ^ 1;
        // No sibling means the node was promoted; nothing to add.
        if sibling < level.len() {
            proof.push(level[sibling]);
        }
        index /= 2;
    }
    proof
}

/// Check membership of `address` under `root`.
pub fn verify(address: &Address, root: H256, proof: &[H256]) -> bool {
    let computed = proof
        .iter()
        .fold(leaf_hash(address), |acc, sibling| hash_pair(acc, *sibling));
    computed == root
}
