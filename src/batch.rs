//! Micro-batch structure consumed by the slot finder.
//!
//! A micro-batch groups `n_tokens` tokens into `n_seqs` sequence groups of
//! `n_seq_tokens` tokens each. Token `i` of group `s` sits at flat index
//! `s * n_seq_tokens + i` in [`MicroBatch::pos`]. Each group carries the list
//! of sequence ids its tokens belong to; more than one id means the tokens
//! are shared between sequences (prompt sharing).

use crate::cell::{Pos, SeqId};

/// A batch of tokens headed for the cache.
#[derive(Debug, Clone)]
pub struct MicroBatch {
    /// Total number of tokens in the batch.
    pub n_tokens: usize,

    /// Number of sequence groups.
    pub n_seqs: usize,

    /// Tokens per sequence group.
    pub n_seq_tokens: usize,

    /// Whether every group carries the same number of tokens. Required by the
    /// recurrent slot finder.
    pub equal_seqs: bool,

    /// Token positions, flat, length `n_tokens`.
    pub pos: Vec<Pos>,

    /// Per-group sequence id lists, length `n_seqs`.
    pub seq_id: Vec<Vec<SeqId>>,
}

impl MicroBatch {
    /// A batch of single-token groups, all belonging to one sequence.
    ///
    /// This is the shape the attention slot finder sees for ordinary prefill
    /// and decode steps: `n_seqs = n_tokens`, one token per group.
    pub fn for_sequence(seq: SeqId, positions: &[Pos]) -> Self {
        Self {
            n_tokens: positions.len(),
            n_seqs: positions.len(),
            n_seq_tokens: 1,
            equal_seqs: false,
            pos: positions.to_vec(),
            seq_id: positions.iter().map(|_| vec![seq]).collect(),
        }
    }

    /// A batch of equal-length sequence groups.
    ///
    /// Each entry pairs a group's sequence id list with its token positions;
    /// every group must supply exactly `n_seq_tokens` positions.
    pub fn grouped(n_seq_tokens: usize, groups: &[(Vec<SeqId>, Vec<Pos>)]) -> Self {
        let mut pos = Vec::with_capacity(groups.len() * n_seq_tokens);
        let mut seq_id = Vec::with_capacity(groups.len());
        for (ids, positions) in groups {
            debug_assert_eq!(positions.len(), n_seq_tokens);
            pos.extend_from_slice(positions);
            seq_id.push(ids.clone());
        }
        Self {
            n_tokens: groups.len() * n_seq_tokens,
            n_seqs: groups.len(),
            n_seq_tokens,
            equal_seqs: true,
            pos,
            seq_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn for_sequence_builds_single_token_groups() {
        let batch = MicroBatch::for_sequence(2, &[0, 1, 2]);
        assert_eq!(batch.n_tokens, 3);
        assert_eq!(batch.n_seqs, 3);
        assert_eq!(batch.n_seq_tokens, 1);
        assert!(!batch.equal_seqs);
        assert_eq!(batch.pos, vec![0, 1, 2]);
        assert_eq!(batch.seq_id, vec![vec![2], vec![2], vec![2]]);
    }

    #[test]
    fn grouped_flattens_positions_in_group_order() {
        let batch = MicroBatch::grouped(2, &[(vec![0], vec![4, 5]), (vec![1, 3], vec![8, 9])]);
        assert_eq!(batch.n_tokens, 4);
        assert_eq!(batch.n_seqs, 2);
        assert!(batch.equal_seqs);
        assert_eq!(batch.pos, vec![4, 5, 8, 9]);
        assert_eq!(batch.seq_id[1], vec![1, 3]);
    }
}
