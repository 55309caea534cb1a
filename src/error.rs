//! Error types for the kv-cache crate.

use thiserror::Error;

use crate::cell::{Pos, SeqId};

/// Top-level error type for cache operations.
#[derive(Error, Debug)]
pub enum KvCacheError {
    #[error("allocation failure: {0}")]
    AllocationFailure(String),

    #[error("batch of {n_tokens} tokens exceeds cache size {size}")]
    SlotTooLarge { n_tokens: usize, size: usize },

    #[error("no contiguous slot available for {n_tokens} tokens")]
    NoSlot { n_tokens: usize },

    #[error("sequence id {seq_id} out of range (cache holds at most {size} sequences)")]
    SeqIdOutOfRange { seq_id: SeqId, size: usize },

    #[error("range [{p0}, {p1}) would partially erase a recurrent state")]
    PartialRecurrentErase { p0: Pos, p1: Pos },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, KvCacheError>;
