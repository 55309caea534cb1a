//! The key-value cache: cell table, slot finder, and sequence mutators.
//!
//! The cache stores per-layer key and value activations for the tokens of one
//! or more concurrent generation sequences. A fixed pool of logical cells is
//! the source of truth for positions and sequence membership; the physical
//! K/V tensors live in backend buffers allocated once at construction.
//!
//! Two storage disciplines share this type:
//!
//! - **Attention mode** (transformers): one cell per token. The slot finder
//!   scans for a contiguous run of empty cells for each incoming batch.
//! - **Recurrent mode** (Mamba/RWKV class): one cell per *sequence state*.
//!   Cell `i` doubles as the anchor for sequence id `i`: its `tail` field
//!   names the cell currently holding that sequence's state, which makes the
//!   id-to-state lookup O(1). The slot finder reshuffles states so the active
//!   sequences occupy one contiguous span the compute graph can stride over.
//!
//! The cache is single-threaded; callers serialize access. Mutators and the
//! slot finder observe the cache in call order.

use std::collections::BTreeMap;

use tracing::{debug, error, info, warn};

use crate::backend::{BackendBuffer, Dtype, KvTensor, MemoryDomain};
use crate::batch::MicroBatch;
use crate::cell::{KvCell, Pos, SeqId};
use crate::error::{KvCacheError, Result};
use crate::model::{Architecture, ModelMetadata};

/// Construction parameters for [`KvCache`].
#[derive(Debug, Clone)]
pub struct CacheParams {
    /// Element type of the K tensors.
    pub type_k: Dtype,
    /// Element type of the V tensors.
    pub type_v: Dtype,
    /// Number of cells.
    pub kv_size: usize,
    /// Place each layer's tensors on that layer's device instead of host.
    pub offload: bool,
    /// Whether the host runs flash-attention kernels (affects V layout and
    /// slot padding).
    pub flash_attn: bool,
}

impl Default for CacheParams {
    fn default() -> Self {
        Self {
            type_k: Dtype::F16,
            type_v: Dtype::F16,
            kv_size: 4096,
            offload: false,
            flash_attn: false,
        }
    }
}

/// Where a batch was placed: the half-open cell range `[offset, offset + len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotInfo {
    pub offset: usize,
    pub len: usize,
}

/// Cell-count granularity callers must round batch sizes up to.
///
/// The flash-attention kernels need the larger padding to avoid runtime
/// boundary checks.
pub fn get_padding(flash_attn: bool) -> usize {
    if flash_attn {
        256
    } else {
        32
    }
}

/// The key-value cache. See the module docs for the storage disciplines.
#[derive(Debug)]
pub struct KvCache {
    /// Capacity in cells. Immutable after construction.
    size: usize,

    /// The cell table, exactly `size` entries.
    cells: Vec<KvCell>,

    /// Search hint: the smallest index the next slot search starts from.
    head: usize,

    /// Number of cells with `pos >= 0`.
    used: usize,

    /// Span length of the last reserved range (recurrent mode only).
    n: usize,

    /// Set when any live cell's position was shifted; the host folds the
    /// accumulated deltas into RoPE at graph build and calls
    /// [`KvCache::reset_shift`].
    has_shift: bool,

    /// Set when the host should rebuild a compact layout (attention mode).
    do_defrag: bool,

    recurrent: bool,
    v_trans: bool,
    can_shift: bool,

    type_k: Dtype,
    type_v: Dtype,

    /// Per-layer K tensors, `n_layer` entries.
    k_l: Vec<KvTensor>,
    /// Per-layer V tensors, `n_layer` entries.
    v_l: Vec<KvTensor>,

    /// Backing allocations, one per memory domain in use.
    bufs: Vec<BackendBuffer>,
}

impl KvCache {
    /// Build a cache for `model`, allocating all tensors up front.
    ///
    /// One flat 1-D tensor pair is created per layer, sized
    /// `width(layer) * kv_size`, grouped into one buffer per memory domain.
    /// Buffers are zeroed so padding regions never hold denormals.
    pub fn new(model: &ModelMetadata, params: &CacheParams) -> Result<Self> {
        let n_layer = model.n_layer;
        let kv_size = params.kv_size;

        let recurrent = model.is_recurrent();
        let v_trans = !recurrent && !params.flash_attn;
        // MLA folds positions into the latent projection, so shifting is out.
        let can_shift = !recurrent && model.architecture != Architecture::DeepseekMla;

        info!(
            kv_size,
            offload = params.offload,
            type_k = %params.type_k,
            type_v = %params.type_v,
            n_layer,
            can_shift,
            "initializing kv cache"
        );

        // Plan one K and one V tensor per layer, grouped by memory domain.
        let mut domains: BTreeMap<MemoryDomain, Vec<usize>> = BTreeMap::new();
        let mut widths = Vec::with_capacity(n_layer);
        for i in 0..n_layer {
            let n_embd_k = model.n_embd_k_gqa(i) + model.n_embd_k_s();
            let n_embd_v = model.n_embd_v_gqa(i) + model.n_embd_v_s();

            debug!(layer = i, n_embd_k, n_embd_v, "kv cache layer widths");

            let domain = if params.offload {
                model.dev_layer(i)
            } else {
                MemoryDomain::Host
            };
            domains.entry(domain).or_default().push(i);
            widths.push((n_embd_k, n_embd_v));
        }

        let tensor_bytes = |width: usize, dtype: Dtype| -> Result<usize> {
            width
                .checked_mul(kv_size)
                .and_then(|len| len.checked_mul(dtype.size_bytes()))
                .ok_or_else(|| {
                    KvCacheError::AllocationFailure(format!(
                        "tensor of {width} x {kv_size} elements overflows"
                    ))
                })
        };

        let mut k_l: Vec<Option<KvTensor>> = vec![None; n_layer];
        let mut v_l: Vec<Option<KvTensor>> = vec![None; n_layer];
        let mut bufs = Vec::with_capacity(domains.len());

        for (domain, layers) in &domains {
            let mut total = 0usize;
            for &i in layers {
                let (wk, wv) = widths[i];
                total += tensor_bytes(wk, params.type_k)?;
                total += tensor_bytes(wv, params.type_v)?;
            }

            let buf_idx = bufs.len();
            let mut buf = BackendBuffer::alloc(*domain, total)?;
            buf.clear();

            let mut offset = 0;
            for &i in layers {
                let (wk, wv) = widths[i];
                let k = KvTensor {
                    name: format!("cache_k_l{i}"),
                    dtype: params.type_k,
                    len: wk * kv_size,
                    buf: buf_idx,
                    offset,
                };
                offset += k.size_bytes();
                let v = KvTensor {
                    name: format!("cache_v_l{i}"),
                    dtype: params.type_v,
                    len: wv * kv_size,
                    buf: buf_idx,
                    offset,
                };
                offset += v.size_bytes();
                k_l[i] = Some(k);
                v_l[i] = Some(v);
            }

            info!(
                domain = %domain,
                size_mib = buf.size_bytes() as f64 / 1024.0 / 1024.0,
                "kv buffer allocated"
            );
            bufs.push(buf);
        }

        Ok(Self {
            size: kv_size,
            cells: vec![KvCell::default(); kv_size],
            head: 0,
            used: 0,
            n: 0,
            has_shift: false,
            do_defrag: false,
            recurrent,
            v_trans,
            can_shift,
            type_k: params.type_k,
            type_v: params.type_v,
            k_l: k_l.into_iter().flatten().collect(),
            v_l: v_l.into_iter().flatten().collect(),
            bufs,
        })
    }

    /// Capacity in cells.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The cell table. Read-only; all mutation goes through the cache API.
    pub fn cells(&self) -> &[KvCell] {
        &self.cells
    }

    /// Current slot-search hint.
    pub fn head(&self) -> usize {
        self.head
    }

    /// Number of cells holding at least one token or state.
    pub fn used_cells(&self) -> usize {
        self.used
    }

    /// Total token count: the sum of sequence memberships over all cells.
    /// A cell shared by two sequences counts twice.
    pub fn n_tokens(&self) -> usize {
        self.cells.iter().map(|c| c.seq_id.len()).sum()
    }

    /// Sum of all backing buffer sizes in bytes.
    pub fn total_size(&self) -> usize {
        self.bufs.iter().map(|b| b.size_bytes()).sum()
    }

    /// Maximum position across all cells, `-1` when the cache is empty.
    // TODO: better data structures to reduce the cost of this operation
    pub fn max_pos(&self) -> Pos {
        self.cells.iter().map(|c| c.pos).max().unwrap_or(-1)
    }

    /// Index one past the last non-empty cell. Bounds how much of the cell
    /// range a compute graph has to consider.
    pub fn cell_max(&self) -> usize {
        for i in (0..self.size).rev() {
            let cell = &self.cells[i];
            if cell.pos >= 0 && !cell.is_empty() {
                return i + 1;
            }
        }
        0
    }

    /// Whether positional shifts can be applied to this cache.
    pub fn can_shift(&self) -> bool {
        self.can_shift
    }

    /// Whether any live cell carries an unconsumed positional shift.
    pub fn has_shift(&self) -> bool {
        self.has_shift
    }

    /// Whether V tensors are stored transposed.
    pub fn v_trans(&self) -> bool {
        self.v_trans
    }

    /// Whether this cache stores one state per sequence.
    pub fn is_recurrent(&self) -> bool {
        self.recurrent
    }

    /// Whether the host should rebuild a compact layout.
    pub fn needs_defrag(&self) -> bool {
        self.do_defrag
    }

    /// Element type of the K tensors.
    pub fn type_k(&self) -> Dtype {
        self.type_k
    }

    /// Element type of the V tensors.
    pub fn type_v(&self) -> Dtype {
        self.type_v
    }

    /// Per-layer K tensor handles.
    pub fn k_l(&self) -> &[KvTensor] {
        &self.k_l
    }

    /// Per-layer V tensor handles.
    pub fn v_l(&self) -> &[KvTensor] {
        &self.v_l
    }

    /// Backing buffers, indexed by [`KvTensor::buf`].
    pub fn buffers(&self) -> &[BackendBuffer] {
        &self.bufs
    }

    /// Read-write access to one buffer, for the compute graph.
    pub fn buffer_mut(&mut self, idx: usize) -> &mut BackendBuffer {
        &mut self.bufs[idx]
    }

    /// Reset every cell and zero all buffers. Allocations are kept.
    pub fn clear(&mut self) {
        for cell in &mut self.cells {
            cell.pos = -1;
            cell.seq_id.clear();
            cell.src = -1;
            cell.tail = -1;
        }
        self.head = 0;
        self.used = 0;

        for buf in &mut self.bufs {
            buf.clear();
        }
    }

    /// Find a contiguous cell range for `batch` and record its tokens.
    ///
    /// Attention mode reserves one cell per token; recurrent mode assigns one
    /// cell per sequence state and compacts the active sequences into a
    /// single span. On failure the cache is left untouched, except that the
    /// recurrent path may have already dropped stale sequence aliases.
    pub fn find_slot(&mut self, batch: &MicroBatch) -> Result<SlotInfo> {
        if self.recurrent {
            self.find_slot_recurrent(batch)
        } else {
            self.find_slot_attention(batch)
        }
    }

    fn find_slot_attention(&mut self, batch: &MicroBatch) -> Result<SlotInfo> {
        let n_tokens = batch.n_tokens;

        if n_tokens > self.size {
            error!(n_tokens, size = self.size, "batch exceeds cache size");
            return Err(KvCacheError::SlotTooLarge {
                n_tokens,
                size: self.size,
            });
        }

        let mut n_tested = 0;

        loop {
            if self.head + n_tokens > self.size {
                n_tested += self.size - self.head;
                self.head = 0;
                continue;
            }

            let mut found = true;
            for i in 0..n_tokens {
                if self.cells[self.head + i].pos >= 0 {
                    found = false;
                    self.head += i + 1;
                    n_tested += i + 1;
                    break;
                }
            }

            if found {
                break;
            }

            if n_tested >= self.size {
                return Err(KvCacheError::NoSlot { n_tokens });
            }
        }

        for s in 0..batch.n_seqs {
            for i in 0..batch.n_seq_tokens {
                let k = s * batch.n_seq_tokens + i;
                let cell = &mut self.cells[self.head + k];
                cell.pos = batch.pos[k];
                for &seq_id in &batch.seq_id[s] {
                    cell.seq_id.insert(seq_id);
                }
            }
        }

        self.used += n_tokens;

        Ok(SlotInfo {
            offset: self.head,
            len: n_tokens,
        })
    }

    fn find_slot_recurrent(&mut self, batch: &MicroBatch) -> Result<SlotInfo> {
        // Each cell stores the state for a whole sequence, and the reserved
        // span must be contiguous, so only batches with an equal number of
        // new tokens per sequence can be placed.
        assert!(
            batch.equal_seqs,
            "recurrent slot search requires equal-length sequence groups"
        );

        let size = self.size;
        let n_seqs = batch.n_seqs;
        let n_seq_tokens = batch.n_seq_tokens;

        let mut min = size as i32 - 1;
        let mut max = 0i32;

        // Everything fits as long as all seq_ids index into the cell table.
        // Aliases beyond the first are unshared here: a shared recurrent
        // state cannot be advanced for two owners at once, so stale aliasing
        // is dropped before placement (this side effect survives failure on
        // purpose; the aliasing was already wrong).
        for s in 0..n_seqs {
            for (j, &seq_id) in batch.seq_id[s].iter().enumerate() {
                if seq_id < 0 || seq_id as usize >= size {
                    error!(seq_id, n_seq_max = size, "sequence id out of range");
                    return Err(KvCacheError::SeqIdOutOfRange { seq_id, size });
                }
                if j > 0 {
                    let tail = self.cells[seq_id as usize].tail;
                    if tail >= 0 {
                        let t = tail as usize;
                        self.cells[t].seq_id.remove(&seq_id);
                        self.cells[seq_id as usize].tail = -1;
                        if self.cells[t].seq_id.is_empty() {
                            self.cells[t].pos = -1;
                            self.cells[t].src = -1;
                            self.used -= 1;
                        }
                    }
                }
            }
        }

        #[cfg(debug_assertions)]
        self.verify_tails();

        // Find the next empty cell, searching circularly from the hint.
        let mut next_empty_cell = self.head;
        for _ in 0..size {
            if next_empty_cell >= size {
                next_empty_cell -= size;
            }
            if self.cells[next_empty_cell].is_empty() {
                break;
            }
            next_empty_cell += 1;
        }

        // Give every batch sequence a tail cell it owns alone.
        for s in 0..n_seqs {
            let seq_id = batch.seq_id[s][0];
            let sid = seq_id as usize;

            let mut has_cell = false;
            let tail = self.cells[sid].tail;
            if tail >= 0 {
                let cell = &self.cells[tail as usize];
                debug_assert!(cell.has_seq_id(seq_id));
                // Only reuse the cell if this sequence owns it alone.
                if cell.seq_id.len() == 1 {
                    has_cell = true;
                }
            }
            if !has_cell {
                debug_assert!(self.cells[next_empty_cell].is_empty());
                // Move the old (shared) tail state into the empty cell.
                let tail = self.cells[sid].tail;
                if tail >= 0 {
                    let t = tail as usize;
                    let (pos, src) = (self.cells[t].pos, self.cells[t].src);
                    self.cells[t].seq_id.remove(&seq_id);
                    let empty_cell = &mut self.cells[next_empty_cell];
                    empty_cell.pos = pos;
                    empty_cell.src = src;
                    // Overwritten when the positions are finalized below.
                    empty_cell.seq_id.insert(seq_id);
                }
                self.cells[sid].tail = next_empty_cell as i32;

                if s + 1 < n_seqs {
                    next_empty_cell += 1;
                    for _ in 0..size {
                        if next_empty_cell >= size {
                            next_empty_cell -= size;
                        }
                        if self.cells[next_empty_cell].is_empty() {
                            break;
                        }
                        next_empty_cell += 1;
                    }
                }
            }

            let tail = self.cells[sid].tail;
            if min > tail {
                min = tail;
            }
            if max < tail {
                max = tail;
            }
        }

        // Gather: swap states so the batch sequences sit at [min, min + n_seqs).
        for s in 0..n_seqs {
            let dst_id = s as i32 + min;
            let src_id = self.cells[batch.seq_id[s][0] as usize].tail;
            if dst_id != src_id {
                let (d, c) = (dst_id as usize, src_id as usize);
                let (lo, hi) = if d < c { (d, c) } else { (c, d) };
                let (left, right) = self.cells.split_at_mut(hi);
                let (a, b) = (&mut left[lo], &mut right[0]);
                std::mem::swap(&mut a.pos, &mut b.pos);
                std::mem::swap(&mut a.src, &mut b.src);
                std::mem::swap(&mut a.seq_id, &mut b.seq_id);

                // Repoint tails at the swapped contents. The two sequence
                // sets never overlap, so both passes are safe.
                let src_seqs: Vec<SeqId> = self.cells[c].seq_id.iter().copied().collect();
                for sid in src_seqs {
                    self.cells[sid as usize].tail = src_id;
                }
                let dst_seqs: Vec<SeqId> = self.cells[d].seq_id.iter().copied().collect();
                for sid in dst_seqs {
                    self.cells[sid as usize].tail = dst_id;
                }
            }
        }

        // Finalize positions and memberships of the placed sequences.
        for s in 0..n_seqs {
            let last_pos = batch.pos[n_seq_tokens * s + n_seq_tokens - 1];
            let cell_id = (s as i32 + min) as usize;

            let prev_pos = self.cells[cell_id].pos;
            if prev_pos >= 0 && last_pos != prev_pos + n_seq_tokens as Pos {
                // The host engine is authoritative about sequence topology,
                // so a jumped or regressed position is logged, not refused.
                warn!(
                    last_pos,
                    prev_pos,
                    seq_id = batch.seq_id[s][0],
                    n_seq_tokens,
                    "non-consecutive token position"
                );
            }
            self.cells[cell_id].pos = last_pos;
            self.cells[cell_id].seq_id.clear();
            for &seq_id in &batch.seq_id[s] {
                self.cells[cell_id].seq_id.insert(seq_id);
                self.cells[seq_id as usize].tail = cell_id as i32;
            }
        }

        // Expose the span of active cells as [head, head + n).
        self.head = min as usize;
        self.n = (max - min + 1) as usize;
        self.used = self.cells.iter().filter(|c| !c.is_empty()).count();

        if self.n >= n_seqs {
            Ok(SlotInfo {
                offset: self.head,
                len: self.n,
            })
        } else {
            Err(KvCacheError::NoSlot {
                n_tokens: batch.n_tokens,
            })
        }
    }

    /// Debug-build consistency check: every sequence id present in a cell
    /// must be tailed by exactly that cell.
    #[cfg(debug_assertions)]
    fn verify_tails(&self) {
        let mut tails_verif = vec![-1i32; self.size];
        for (i, cell) in self.cells.iter().enumerate() {
            for &seq_id in &cell.seq_id {
                if tails_verif[seq_id as usize] != -1 {
                    error!(
                        seq_id,
                        cell_a = tails_verif[seq_id as usize],
                        cell_b = i,
                        "duplicate tail for sequence"
                    );
                }
                tails_verif[seq_id as usize] = i as i32;
            }
        }
        for i in 0..self.size {
            if tails_verif[i] != self.cells[i].tail {
                error!(
                    seq_id = i,
                    stored = self.cells[i].tail,
                    actual = tails_verif[i],
                    "wrong tail for sequence"
                );
            }
        }
    }

    /// Remove `seq_id`'s tokens with positions in `[p0, p1)`. Negative `p0`
    /// means 0, negative `p1` means unbounded, and a negative `seq_id` drops
    /// every sequence from the matched cells.
    ///
    /// Recurrent states cannot be erased partially: the range must cover the
    /// whole state or miss it entirely.
    pub fn seq_rm(&mut self, seq_id: SeqId, p0: Pos, p1: Pos) -> Result<()> {
        let mut new_head = self.size;

        let p0 = if p0 < 0 { 0 } else { p0 };
        let p1 = if p1 < 0 { Pos::MAX } else { p1 };

        if self.recurrent {
            if seq_id as i64 >= self.size as i64 {
                return Err(KvCacheError::SeqIdOutOfRange {
                    seq_id,
                    size: self.size,
                });
            }
            if seq_id >= 0 {
                let tail_id = self.cells[seq_id as usize].tail;
                if tail_id >= 0 {
                    let cell_pos = self.cells[tail_id as usize].pos;
                    // A range cutting through the state is invalid.
                    if (0 < p0 && p0 <= cell_pos) || (0 < p1 && p1 <= cell_pos) {
                        return Err(KvCacheError::PartialRecurrentErase { p0, p1 });
                    }
                    // Invalidate tails that are about to be cleared.
                    if p0 <= cell_pos && cell_pos < p1 {
                        self.cells[seq_id as usize].tail = -1;
                    }
                }
            } else {
                // With no sequence given, the range must be everything or
                // nothing.
                if p0 != p1 && (p0 != 0 || p1 != Pos::MAX) {
                    return Err(KvCacheError::PartialRecurrentErase { p0, p1 });
                }
            }
        }

        for i in 0..self.size {
            let cell = &mut self.cells[i];
            if cell.pos >= p0 && cell.pos < p1 {
                if seq_id < 0 {
                    cell.seq_id.clear();
                } else if cell.has_seq_id(seq_id) {
                    cell.seq_id.remove(&seq_id);
                } else {
                    continue;
                }
                if cell.is_empty() {
                    if cell.pos >= 0 {
                        self.used -= 1;
                    }

                    cell.pos = -1;
                    cell.src = -1;

                    if new_head == self.size {
                        new_head = i;
                    }
                }
            }
        }

        // If a slot was freed below the hint, let the next search start there.
        if new_head != self.size && new_head < self.head {
            self.head = new_head;
        }

        Ok(())
    }

    /// Make `seq_id_dst` reference `seq_id_src`'s tokens with positions in
    /// `[p0, p1)`. In recurrent mode the destination is detached from its
    /// current state and attached to the source's, regardless of range.
    pub fn seq_cp(&mut self, seq_id_src: SeqId, seq_id_dst: SeqId, p0: Pos, p1: Pos) {
        if seq_id_src == seq_id_dst {
            return;
        }

        let p0 = if p0 < 0 { 0 } else { p0 };
        let p1 = if p1 < 0 { Pos::MAX } else { p1 };

        if self.recurrent {
            let in_range = |id: SeqId| id >= 0 && (id as usize) < self.size;
            if in_range(seq_id_src) && in_range(seq_id_dst) {
                let tail_dst = self.cells[seq_id_dst as usize].tail;
                if tail_dst >= 0 {
                    // Detach the destination from whatever it pointed at.
                    let t = tail_dst as usize;
                    self.cells[t].seq_id.remove(&seq_id_dst);
                    self.cells[seq_id_dst as usize].tail = -1;
                    if self.cells[t].seq_id.is_empty() {
                        self.cells[t].pos = -1;
                        self.cells[t].src = -1;
                        self.used -= 1;
                    }
                }
                let tail_src = self.cells[seq_id_src as usize].tail;
                if tail_src >= 0 {
                    self.cells[tail_src as usize].seq_id.insert(seq_id_dst);
                    self.cells[seq_id_dst as usize].tail = tail_src;
                }
            }

            return;
        }

        self.head = 0;

        for cell in &mut self.cells {
            if cell.has_seq_id(seq_id_src) && cell.pos >= p0 && cell.pos < p1 {
                cell.seq_id.insert(seq_id_dst);
            }
        }
    }

    /// Drop every sequence except `seq_id` from the cache.
    pub fn seq_keep(&mut self, seq_id: SeqId) {
        let mut new_head = self.size;

        for i in 0..self.size {
            if self.recurrent && i as SeqId != seq_id {
                self.cells[i].tail = -1;
            }

            let cell = &mut self.cells[i];
            if !cell.has_seq_id(seq_id) {
                if cell.pos >= 0 {
                    self.used -= 1;
                }

                cell.pos = -1;
                cell.src = -1;
                cell.seq_id.clear();

                if new_head == self.size {
                    new_head = i;
                }
            } else {
                cell.seq_id.clear();
                cell.seq_id.insert(seq_id);
            }
        }

        if new_head != self.size && new_head < self.head {
            self.head = new_head;
        }
    }

    /// Shift `seq_id`'s positions in `[p0, p1)` by `delta`. Tokens shifted
    /// below position 0 are dropped. The shift is recorded per cell and
    /// surfaced through [`KvCache::has_shift`] until the host consumes it.
    pub fn seq_add(&mut self, seq_id: SeqId, p0: Pos, p1: Pos, delta: Pos) {
        if delta == 0 {
            return;
        }

        let mut new_head = self.size;

        let p0 = if p0 < 0 { 0 } else { p0 };
        let p1 = if p1 < 0 { Pos::MAX } else { p1 };

        if p0 == p1 {
            return;
        }

        if self.recurrent {
            // Only the state cell's position moves; there is no per-token
            // bookkeeping to rewrite.
            if seq_id >= 0 && (seq_id as usize) < self.size {
                let tail_id = self.cells[seq_id as usize].tail;
                if tail_id >= 0 {
                    let cell = &mut self.cells[tail_id as usize];
                    if cell.has_seq_id(seq_id) && p0 <= cell.pos && cell.pos < p1 {
                        cell.pos += delta;
                    }
                }
            }
            return;
        }

        for i in 0..self.size {
            let cell = &mut self.cells[i];
            if cell.has_seq_id(seq_id) && cell.pos >= p0 && cell.pos < p1 {
                self.has_shift = true;
                cell.pos += delta;
                cell.delta += delta;

                if cell.pos < 0 {
                    if !cell.is_empty() {
                        self.used -= 1;
                    }
                    cell.pos = -1;
                    cell.src = -1;
                    cell.seq_id.clear();
                    if new_head == self.size {
                        new_head = i;
                    }
                }
            }
        }

        // Start the next search from the earliest freed slot, or rewind.
        self.head = if new_head != self.size { new_head } else { 0 };
    }

    /// Integer-divide `seq_id`'s positions in `[p0, p1)` by `d`, used when
    /// the host collapses self-extended contexts.
    pub fn seq_div(&mut self, seq_id: SeqId, p0: Pos, p1: Pos, d: i32) {
        if d == 1 {
            return;
        }

        let p0 = if p0 < 0 { 0 } else { p0 };
        let p1 = if p1 < 0 { Pos::MAX } else { p1 };

        if p0 == p1 {
            return;
        }

        if self.recurrent {
            if seq_id >= 0 && (seq_id as usize) < self.size {
                let tail_id = self.cells[seq_id as usize].tail;
                if tail_id >= 0 {
                    let cell = &mut self.cells[tail_id as usize];
                    if cell.has_seq_id(seq_id) && p0 <= cell.pos && cell.pos < p1 {
                        cell.pos /= d;
                    }
                }
            }
            return;
        }

        for cell in &mut self.cells {
            if cell.has_seq_id(seq_id) && cell.pos >= p0 && cell.pos < p1 {
                self.has_shift = true;

                let p_old = cell.pos;
                cell.pos /= d;
                cell.delta += cell.pos - p_old;
            }
        }
    }

    /// Maximum position of `seq_id`'s tokens, 0 when the sequence is absent.
    pub fn seq_pos_max(&self, seq_id: SeqId) -> Pos {
        let mut result = 0;
        for cell in &self.cells {
            if cell.has_seq_id(seq_id) {
                result = result.max(cell.pos);
            }
        }
        result
    }

    /// Ask the host to rebuild a compact layout at the next graph build.
    /// Meaningless for recurrent caches, where states already pack.
    pub fn defrag(&mut self) {
        if !self.recurrent {
            self.do_defrag = true;
        }
    }

    /// Acknowledge a requested defrag once the host has rebuilt the layout.
    pub fn reset_defrag(&mut self) {
        self.do_defrag = false;
    }

    /// Drop all accumulated positional shifts. Called by the host after it
    /// has folded the deltas into the RoPE frequencies; the cache never
    /// consumes them itself.
    pub fn reset_shift(&mut self) {
        for cell in &mut self.cells {
            cell.delta = 0;
        }
        self.has_shift = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_model() -> ModelMetadata {
        ModelMetadata {
            architecture: Architecture::Llama,
            n_layer: 2,
            n_head_kv: 2,
            head_dim: 4,
            ssm_d_conv: 0,
            ssm_d_inner: 0,
            ssm_d_state: 0,
            layer_devices: Vec::new(),
        }
    }

    fn tiny_cache(kv_size: usize) -> KvCache {
        KvCache::new(
            &tiny_model(),
            &CacheParams {
                kv_size,
                ..CacheParams::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn new_cache_is_empty() {
        let cache = tiny_cache(8);
        assert_eq!(cache.size(), 8);
        assert_eq!(cache.used_cells(), 0);
        assert_eq!(cache.n_tokens(), 0);
        assert_eq!(cache.max_pos(), -1);
        assert_eq!(cache.cell_max(), 0);
        assert!(cache.can_shift());
        assert!(cache.v_trans());
        assert!(!cache.is_recurrent());
    }

    #[test]
    fn tensor_geometry_matches_model() {
        let cache = tiny_cache(8);
        // 2 KV heads of dim 4 make an 8-wide column; 8 cells per tensor.
        assert_eq!(cache.k_l().len(), 2);
        assert_eq!(cache.v_l().len(), 2);
        assert_eq!(cache.k_l()[0].len, 8 * 8);
        assert_eq!(cache.v_l()[1].len, 8 * 8);
        assert_eq!(cache.k_l()[1].name, "cache_k_l1");
        // One host buffer holding K and V for both layers, f16.
        assert_eq!(cache.buffers().len(), 1);
        assert_eq!(cache.total_size(), 2 * 2 * 8 * 8 * 2);
    }

    #[test]
    fn offload_groups_layers_by_device() {
        let mut model = tiny_model();
        model.layer_devices = vec![0, 1];
        let cache = KvCache::new(
            &model,
            &CacheParams {
                kv_size: 4,
                offload: true,
                ..CacheParams::default()
            },
        )
        .unwrap();
        assert_eq!(cache.buffers().len(), 2);
        assert_eq!(cache.buffers()[0].domain(), MemoryDomain::Device(0));
        assert_eq!(cache.buffers()[1].domain(), MemoryDomain::Device(1));
        // Each layer's K and V share a buffer with each other only.
        assert_ne!(cache.k_l()[0].buf, cache.k_l()[1].buf);
        assert_eq!(cache.k_l()[0].buf, cache.v_l()[0].buf);
    }

    #[test]
    fn flash_attn_disables_v_transpose() {
        let cache = KvCache::new(
            &tiny_model(),
            &CacheParams {
                kv_size: 4,
                flash_attn: true,
                ..CacheParams::default()
            },
        )
        .unwrap();
        assert!(!cache.v_trans());
    }

    #[test]
    fn mla_architecture_cannot_shift() {
        let mut model = tiny_model();
        model.architecture = Architecture::DeepseekMla;
        let cache = KvCache::new(
            &model,
            &CacheParams {
                kv_size: 4,
                ..CacheParams::default()
            },
        )
        .unwrap();
        assert!(!cache.can_shift());
    }

    #[test]
    fn padding_depends_on_flash_attn() {
        assert_eq!(get_padding(false), 32);
        assert_eq!(get_padding(true), 256);
    }

    #[test]
    fn defrag_flag_roundtrip() {
        let mut cache = tiny_cache(4);
        assert!(!cache.needs_defrag());
        cache.defrag();
        assert!(cache.needs_defrag());
        cache.reset_defrag();
        assert!(!cache.needs_defrag());
    }

    #[test]
    fn reset_shift_clears_deltas() {
        let mut cache = tiny_cache(8);
        cache
            .find_slot(&MicroBatch::for_sequence(0, &[0, 1, 2]))
            .unwrap();
        cache.seq_add(0, 0, 3, 5);
        assert!(cache.has_shift());
        assert_eq!(cache.cells()[0].delta, 5);

        cache.reset_shift();
        assert!(!cache.has_shift());
        assert_eq!(cache.cells()[0].delta, 0);
        // Positions keep their shifted values; only the lazy record is gone.
        assert_eq!(cache.cells()[0].pos, 5);
    }
}
