//! Cryptographic proofs between committed transactions, plus their
//! client-side verifiers.
//!
//! A [`DualProof`] combines linear linking (each tx hashes the previous
//! accumulative hash) with binary linking (the append-only tree over Alh
//! values): inclusion of the source under the target's witnessed root,
//! consistency between both witnessed roots, the last-leaf proof anchoring
//! the target root, a linear chain over the tail the tree does not yet
//! cover, and a linear-advance bridge for the segment the tree consumed
//! since the source.

use crate::aht::{alh_leaf, verify_consistency, verify_inclusion, verify_last_inclusion};
use crate::tx::TxHeader;
use crate::{sha256, Digest};

/// Terms to derive `Alh@target` from `Alh@source`: the source Alh followed
/// by the inner hashes of every following tx up to the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearProof {
    pub source_tx_id: u64,
    pub target_tx_id: u64,
    pub terms: Vec<Digest>,
}

/// Bridges the part of the old linear chain that the new Merkle tree
/// consumed: each intermediate Alh is proven included in the target tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearAdvanceProof {
    pub linear_proof_terms: Vec<Digest>,
    pub inclusion_proofs: Vec<Vec<Digest>>,
}

#[derive(Debug, Clone)]
pub struct DualProof {
    pub source_tx_header: TxHeader,
    pub target_tx_header: TxHeader,
    pub inclusion_proof: Vec<Digest>,
    pub consistency_proof: Vec<Digest>,
    pub target_bl_tx_alh: Digest,
    pub last_inclusion_proof: Vec<Digest>,
    pub linear_proof: LinearProof,
    pub linear_advance_proof: Option<LinearAdvanceProof>,
}

fn chain_alh(tx_id: u64, prev_alh: &Digest, inner_hash: &Digest) -> Digest {
    sha256(&[&tx_id.to_be_bytes(), prev_alh, inner_hash])
}

pub fn verify_linear_proof(
    proof: &LinearProof,
    source_tx_id: u64,
    target_tx_id: u64,
    source_alh: Digest,
    target_alh: Digest,
) -> bool {
    if proof.source_tx_id != source_tx_id || proof.target_tx_id != target_tx_id {
        return false;
    }
    if source_tx_id == 0 || source_tx_id > target_tx_id {
        return false;
    }
    if proof.terms.len() as u64 != target_tx_id - source_tx_id + 1 {
        return false;
    }
    if proof.terms[0] != source_alh {
        return false;
    }
    let mut calc = proof.terms[0];
    for (i, term) in proof.terms.iter().enumerate().skip(1) {
        calc = chain_alh(source_tx_id + i as u64, &calc, term);
    }
    calc == target_alh
}

/// Verifies the bridge for `(start_tx_id, end_tx_id]`: every intermediate
/// Alh must be a leaf of the target tree and the chain must end at
/// `end_alh`.
pub fn verify_linear_advance_proof(
    proof: Option<&LinearAdvanceProof>,
    start_tx_id: u64,
    end_tx_id: u64,
    end_alh: Digest,
    tree_root: Digest,
    tree_size: u64,
) -> bool {
    if end_tx_id < start_tx_id {
        return false;
    }
    if end_tx_id <= start_tx_id + 1 {
        // the linear chain is contiguous; no bridge needed
        return true;
    }
    let Some(proof) = proof else {
        return false;
    };
    if proof.linear_proof_terms.len() as u64 != end_tx_id - start_tx_id {
        return false;
    }
    if proof.inclusion_proofs.len() as u64 != end_tx_id - start_tx_id - 1 {
        return false;
    }
    let mut calc = proof.linear_proof_terms[0];
    for tx_id in start_tx_id + 1..end_tx_id {
        let incl = &proof.inclusion_proofs[(tx_id - start_tx_id - 1) as usize];
        if !verify_inclusion(incl, tx_id - 1, tree_size, alh_leaf(&calc), tree_root) {
            return false;
        }
        calc = chain_alh(
            tx_id + 1,
            &calc,
            &proof.linear_proof_terms[(tx_id - start_tx_id) as usize],
        );
    }
    calc == end_alh
}

/// Full dual-proof verification; headers inside the proof are trusted to
/// the extent that their Alh values are recomputed from them.
pub fn verify_dual_proof(proof: &DualProof) -> bool {
    let source = &proof.source_tx_header;
    let target = &proof.target_tx_header;

    if source.id == 0 || source.id > target.id {
        return false;
    }
    if source.bl_tx_id > target.bl_tx_id {
        return false;
    }

    let source_alh = source.alh();
    let target_alh = target.alh();

    if source.id < target.bl_tx_id
        && !verify_inclusion(
            &proof.inclusion_proof,
            source.id - 1,
            target.bl_tx_id,
            alh_leaf(&source_alh),
            target.bl_root,
        )
    {
        return false;
    }

    if source.bl_tx_id > 0
        && !verify_consistency(
            &proof.consistency_proof,
            source.bl_tx_id,
            target.bl_tx_id,
            source.bl_root,
            target.bl_root,
        )
    {
        return false;
    }

    if target.bl_tx_id > 0
        && !verify_last_inclusion(
            &proof.last_inclusion_proof,
            target.bl_tx_id,
            alh_leaf(&proof.target_bl_tx_alh),
            target.bl_root,
        )
    {
        return false;
    }

    let linear_ok = if source.id < target.bl_tx_id {
        verify_linear_proof(
            &proof.linear_proof,
            target.bl_tx_id,
            target.id,
            proof.target_bl_tx_alh,
            target_alh,
        )
    } else {
        verify_linear_proof(&proof.linear_proof, source.id, target.id, source_alh, target_alh)
    };
    if !linear_ok {
        return false;
    }

    let start = source.bl_tx_id;
    let end = source.id.min(target.bl_tx_id);
    let end_alh = if end == source.id {
        source_alh
    } else {
        proof.target_bl_tx_alh
    };
    verify_linear_advance_proof(
        proof.linear_advance_proof.as_ref(),
        start,
        end,
        end_alh,
        target.bl_root,
        target.bl_tx_id,
    )
}
