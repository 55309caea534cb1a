//! # kv-cache
//!
//! Key-value attention cache for LLM inference: the in-memory structure that
//! stores per-layer key and value activations across the tokens of one or
//! more concurrent generation sequences, and that selects physical storage
//! slots for newly arriving batches.
//!
//! ## Architecture
//!
//! - **Cells** ([`cell`]): the logical cell table, source of truth for token
//!   positions and sequence membership. One cell per token for transformers,
//!   one cell per sequence state for Mamba/RWKV-class models.
//!
//! - **Cache** ([`cache`]): the [`KvCache`] itself: O(1) amortized slot
//!   finding for incoming micro-batches, and the sequence-scoped mutation
//!   API (remove, copy, keep, shift, divide).
//!
//! - **Backend** ([`backend`]): flat per-layer K/V tensors carved out of
//!   per-domain device buffers, allocated once and zeroed at construction.
//!
//! - **Model metadata** ([`model`]): the slice of the model description the
//!   cache reads: layer count, per-layer embedding widths, recurrence.
//!
//! - **Batches** ([`batch`]): the micro-batch shape the slot finder consumes.
//!
//! - **View** ([`view`]): a reusable read-only snapshot for diagnostics.
//!
//! ## Quick start
//!
//! ```rust
//! use kv_cache::{CacheParams, KvCache, MicroBatch, ModelMetadata};
//!
//! let model = ModelMetadata::llama3_8b();
//! let params = CacheParams { kv_size: 64, ..CacheParams::default() };
//! let mut cache = KvCache::new(&model, &params).expect("allocation failed");
//!
//! let batch = MicroBatch::for_sequence(0, &[0, 1, 2]);
//! let slot = cache.find_slot(&batch).expect("no slot");
//! assert_eq!((slot.offset, slot.len), (0, 3));
//! ```

pub mod backend;
pub mod batch;
pub mod cache;
pub mod cell;
pub mod error;
pub mod model;
pub mod view;

pub use backend::{BackendBuffer, Dtype, KvTensor, MemoryDomain};
pub use batch::MicroBatch;
pub use cache::{get_padding, CacheParams, KvCache, SlotInfo};
pub use cell::{KvCell, Pos, SeqId};
pub use error::{KvCacheError, Result};
pub use model::{Architecture, ModelMetadata};
pub use view::{KvCacheView, ViewCell};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
