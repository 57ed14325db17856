//! Per-transaction binary hash tree over entry digests.
//!
//! Leaves are the entry digests (already prefixed with `0x00` by the entry
//! digest function); interior nodes hash `0x01 || left || right`. An odd node
//! at the end of a level is promoted unchanged. The root is the `Eh` field of
//! the transaction header.

use crate::error::{Result, StoreError};
use crate::{sha256, Digest};

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

/// Digest of a raw leaf payload: `SHA-256(0x00 || payload...)`.
pub fn leaf_digest(chunks: &[&[u8]]) -> Digest {
    let mut parts: Vec<&[u8]> = Vec::with_capacity(chunks.len() + 1);
    let prefix = [LEAF_PREFIX];
    parts.push(&prefix);
    parts.extend_from_slice(chunks);
    sha256(&parts)
}

pub(crate) fn node_digest(l: &Digest, r: &Digest) -> Digest {
    sha256(&[&[NODE_PREFIX], l.as_slice(), r.as_slice()])
}

#[derive(Debug, Clone)]
pub struct HTree {
    levels: Vec<Vec<Digest>>,
    width: usize,
}

impl HTree {
    /// Builds the tree bottom-up from precomputed leaf digests.
    pub fn build_with(leaves: &[Digest]) -> Result<Self> {
        if leaves.is_empty() {
            return Err(StoreError::IllegalArgument("hash tree requires leaves"));
        }
        let mut levels: Vec<Vec<Digest>> = vec![leaves.to_vec()];
        while levels.last().expect("non-empty").len() > 1 {
            let prev = levels.last().expect("non-empty");
            let mut next = Vec::with_capacity((prev.len() + 1) / 2);
            let mut i = 0;
            while i + 1 < prev.len() {
                next.push(node_digest(&prev[i], &prev[i + 1]));
                i += 2;
            }
            if prev.len() % 2 == 1 {
                next.push(prev[prev.len() - 1]);
            }
            levels.push(next);
        }
        Ok(Self {
            width: leaves.len(),
            levels,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn root(&self) -> Digest {
        self.levels.last().expect("non-empty")[0]
    }

    /// Sibling path for leaf `i`, leaf level upwards. Levels where the node
    /// was promoted (no sibling) contribute no term.
    pub fn inclusion_proof(&self, i: usize) -> Result<Vec<Digest>> {
        if i >= self.width {
            return Err(StoreError::IllegalArgument("leaf index out of range"));
        }
        let mut path = Vec::new();
        let mut idx = i;
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling = idx ^ 1;
            if sibling < level.len() {
                path.push(level[sibling]);
            }
            idx >>= 1;
        }
        Ok(path)
    }
}

/// Recomputes the root from an inclusion path produced by
/// [`HTree::inclusion_proof`].
pub fn verify_inclusion(path: &[Digest], i: usize, width: usize, leaf: Digest, root: Digest) -> bool {
    if i >= width || width == 0 {
        return false;
    }
    let mut idx = i;
    let mut w = width;
    let mut calc = leaf;
    let mut consumed = 0;
    while w > 1 {
        let has_sibling = idx ^ 1 < w;
        if has_sibling {
            if consumed == path.len() {
                return false;
            }
            let term = path[consumed];
            consumed += 1;
            calc = if idx % 2 == 0 {
                node_digest(&calc, &term)
            } else {
                node_digest(&term, &calc)
            };
        }
        idx >>= 1;
        w = (w + 1) / 2;
    }
    consumed == path.len() && calc == root
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: usize) -> Vec<Digest> {
        (0..n)
            .map(|i| leaf_digest(&[format!("leaf-{i}").as_bytes()]))
            .collect()
    }

    #[test]
    fn single_leaf_root_is_leaf() {
        let ls = leaves(1);
        let t = HTree::build_with(&ls).expect("build");
        assert_eq!(t.root(), ls[0]);
        assert!(t.inclusion_proof(0).expect("proof").is_empty());
    }

    #[test]
    fn inclusion_proofs_verify_for_all_widths() {
        for n in 1..=17 {
            let ls = leaves(n);
            let t = HTree::build_with(&ls).expect("build");
            for i in 0..n {
                let path = t.inclusion_proof(i).expect("proof");
                assert!(
                    verify_inclusion(&path, i, n, ls[i], t.root()),
                    "width {n} leaf {i}"
                );
            }
        }
    }

    #[test]
    fn tampered_leaf_fails_verification() {
        let ls = leaves(8);
        let t = HTree::build_with(&ls).expect("build");
        let path = t.inclusion_proof(3).expect("proof");
        let mut bad = ls[3];
        bad[0] ^= 0xff;
        assert!(!verify_inclusion(&path, 3, 8, bad, t.root()));
    }
}
