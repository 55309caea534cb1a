//! Read-only observer view of the cache, for diagnostics and debugging.
//!
//! The view is a reusable snapshot: [`KvCacheView::update`] refreshes it from
//! a cache without reallocating unless the cache capacity changed. Consumers
//! get per-cell effective positions, per-cell sequence memberships, and the
//! largest contiguous run of empty cells (the best slot a defrag could hope
//! to open up).

use tracing::error;

use crate::cache::KvCache;
use crate::cell::{Pos, SeqId};

/// Effective state of one cell as seen by diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct ViewCell {
    /// The cell's position with its pending shift folded in, `pos + delta`.
    pub pos: Pos,
}

/// A refreshable snapshot of the cache's cell table.
#[derive(Debug)]
pub struct KvCacheView {
    /// Number of cells covered by the snapshot.
    pub n_cells: usize,

    /// Maximum sequence ids recorded per cell; extra memberships are dropped.
    pub n_seq_max: usize,

    /// Sum of sequence memberships over all cells.
    pub token_count: usize,

    /// Number of non-empty cells found during the last update.
    pub used_cells: usize,

    /// Length of the longest run of empty cells.
    pub max_contiguous: usize,

    /// Start index of that run, `-1` when no empty cell exists.
    pub max_contiguous_idx: i32,

    /// Per-cell effective positions, `n_cells` entries.
    pub cells: Vec<ViewCell>,

    /// Per-cell sequence ids, `n_seq_max` per cell, padded with `-1`.
    pub cells_sequences: Vec<SeqId>,
}

impl KvCacheView {
    /// An empty view recording up to `n_seq_max` sequence ids per cell.
    pub fn new(n_seq_max: usize) -> Self {
        Self {
            n_cells: 0,
            n_seq_max,
            token_count: 0,
            used_cells: 0,
            max_contiguous: 0,
            max_contiguous_idx: -1,
            cells: Vec::new(),
            cells_sequences: Vec::new(),
        }
    }

    /// Refresh the snapshot from `kv`. The flat arrays are regrown only when
    /// the cache capacity changed since the last update.
    pub fn update(&mut self, kv: &KvCache) {
        if self.n_cells < kv.size() || self.cells.is_empty() {
            self.n_cells = kv.size();
            self.cells.resize(self.n_cells, ViewCell::default());
            self.cells_sequences.resize(self.n_seq_max * self.n_cells, -1);
        }

        let kv_cells = kv.cells();
        let mut used_cells = 0;
        let mut token_count = 0;
        let mut curr_contig_idx = -1i32;
        let mut max_contig = 0usize;
        let mut max_contig_idx = -1i32;

        for (i, cell) in kv_cells.iter().enumerate() {
            let curr_size = cell.seq_id.len();
            token_count += curr_size;
            self.cells[i].pos = cell.pos + cell.delta;

            if curr_size > 0 {
                if curr_contig_idx >= 0 && (i - curr_contig_idx as usize) > max_contig {
                    max_contig = i - curr_contig_idx as usize;
                    max_contig_idx = curr_contig_idx;
                }
                curr_contig_idx = -1;
            } else if curr_contig_idx < 0 {
                curr_contig_idx = i as i32;
            }

            let row = &mut self.cells_sequences[i * self.n_seq_max..(i + 1) * self.n_seq_max];
            let mut seq_idx = 0;
            for &seq_id in &cell.seq_id {
                if seq_idx >= self.n_seq_max {
                    break;
                }
                row[seq_idx] = seq_id;
                seq_idx += 1;
            }
            if seq_idx != 0 {
                used_cells += 1;
            }
            for slot in row[seq_idx..].iter_mut() {
                *slot = -1;
            }
        }
        if curr_contig_idx >= 0 && kv_cells.len() - curr_contig_idx as usize > max_contig {
            max_contig_idx = curr_contig_idx;
            max_contig = kv_cells.len() - curr_contig_idx as usize;
        }

        self.max_contiguous = max_contig;
        self.max_contiguous_idx = max_contig_idx;
        self.token_count = token_count;
        self.used_cells = used_cells;
        if used_cells != kv.used_cells() {
            error!(
                reported = kv.used_cells(),
                counted = used_cells,
                "used cells mismatch"
            );
        }
    }

    /// The recorded sequence ids of cell `i`, `-1`-padded.
    pub fn cell_sequences(&self, i: usize) -> &[SeqId] {
        &self.cells_sequences[i * self.n_seq_max..(i + 1) * self.n_seq_max]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::MicroBatch;
    use crate::cache::CacheParams;
    use crate::model::{Architecture, ModelMetadata};

    fn cache(kv_size: usize) -> KvCache {
        let model = ModelMetadata {
            architecture: Architecture::Llama,
            n_layer: 1,
            n_head_kv: 1,
            head_dim: 2,
            ssm_d_conv: 0,
            ssm_d_inner: 0,
            ssm_d_state: 0,
            layer_devices: Vec::new(),
        };
        KvCache::new(
            &model,
            &CacheParams {
                kv_size,
                ..CacheParams::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn update_counts_tokens_and_used_cells() {
        let mut kv = cache(8);
        kv.find_slot(&MicroBatch::for_sequence(0, &[0, 1, 2])).unwrap();
        kv.seq_cp(0, 1, -1, -1);

        let mut view = KvCacheView::new(4);
        view.update(&kv);

        assert_eq!(view.n_cells, 8);
        assert_eq!(view.used_cells, 3);
        assert_eq!(view.token_count, 6);
        assert_eq!(view.max_contiguous, 5);
        assert_eq!(view.max_contiguous_idx, 3);

        let row = view.cell_sequences(0);
        let mut ids: Vec<_> = row.iter().copied().filter(|&s| s >= 0).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1]);
        assert!(view.cell_sequences(5).iter().all(|&s| s == -1));
    }

    #[test]
    fn view_folds_delta_into_positions() {
        let mut kv = cache(8);
        kv.find_slot(&MicroBatch::for_sequence(0, &[0, 1, 2])).unwrap();
        kv.seq_add(0, 0, 3, 10);

        let mut view = KvCacheView::new(1);
        view.update(&kv);

        // pos was shifted to 10..13 and delta records another 10 on top.
        assert_eq!(view.cells[0].pos, 20);
        assert_eq!(view.cells[2].pos, 22);
    }

    #[test]
    fn update_reuses_allocations() {
        let mut kv = cache(4);
        let mut view = KvCacheView::new(2);
        view.update(&kv);
        let cells_cap = view.cells.capacity();

        kv.find_slot(&MicroBatch::for_sequence(0, &[0])).unwrap();
        view.update(&kv);
        assert_eq!(view.cells.capacity(), cells_cap);
        assert_eq!(view.used_cells, 1);
    }

    #[test]
    fn empty_cache_is_one_contiguous_run() {
        let kv = cache(6);
        let mut view = KvCacheView::new(1);
        view.update(&kv);
        assert_eq!(view.max_contiguous, 6);
        assert_eq!(view.max_contiguous_idx, 0);
        assert_eq!(view.used_cells, 0);
        assert_eq!(view.token_count, 0);
    }
}
