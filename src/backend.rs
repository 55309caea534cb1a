//! Tensor storage backend for the cache.
//!
//! The cache owns one flat K and one flat V tensor per layer, carved out of a
//! small number of device buffers (one per memory domain). The backend here
//! is deliberately narrow: a buffer knows how to zero itself and report its
//! byte size, and a tensor handle knows its element type, length, and where
//! its bytes live. The compute graph addresses tensors through these handles.

use crate::error::{KvCacheError, Result};

/// Element types storable in K/V tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dtype {
    F16,
    BF16,
    F32,
}

impl Dtype {
    /// Size of a single element in bytes.
    pub fn size_bytes(self) -> usize {
        match self {
            Dtype::F16 | Dtype::BF16 => 2,
            Dtype::F32 => 4,
        }
    }

    /// Human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            Dtype::F16 => "f16",
            Dtype::BF16 => "bf16",
            Dtype::F32 => "f32",
        }
    }

    /// Parse a dtype name, as accepted on the command line.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "f16" => Some(Dtype::F16),
            "bf16" => Some(Dtype::BF16),
            "f32" => Some(Dtype::F32),
            _ => None,
        }
    }
}

impl std::fmt::Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Where a buffer's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemoryDomain {
    /// Host memory.
    Host,
    /// Device memory, by device index.
    Device(usize),
}

impl std::fmt::Display for MemoryDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryDomain::Host => write!(f, "host"),
            MemoryDomain::Device(i) => write!(f, "dev{i}"),
        }
    }
}

/// A backing allocation in one memory domain. Owns its bytes for the lifetime
/// of the cache.
#[derive(Debug)]
pub struct BackendBuffer {
    domain: MemoryDomain,
    data: Vec<u8>,
}

impl BackendBuffer {
    /// Allocate `size_bytes` in `domain`. Fails instead of aborting when the
    /// allocator cannot satisfy the request.
    pub fn alloc(domain: MemoryDomain, size_bytes: usize) -> Result<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(size_bytes).map_err(|e| {
            KvCacheError::AllocationFailure(format!(
                "{domain} buffer of {size_bytes} bytes: {e}"
            ))
        })?;
        data.resize(size_bytes, 0);
        Ok(Self { domain, data })
    }

    /// Zero the whole buffer.
    pub fn clear(&mut self) {
        self.data.fill(0);
    }

    /// Total allocation size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }

    /// The memory domain this buffer lives in.
    pub fn domain(&self) -> MemoryDomain {
        self.domain
    }

    /// Read-write access to a tensor's bytes.
    pub fn bytes_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        &mut self.data[offset..offset + len]
    }

    /// Read-only access to a tensor's bytes.
    pub fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        &self.data[offset..offset + len]
    }
}

/// Handle to one flat 1-D tensor inside a [`BackendBuffer`].
#[derive(Debug, Clone)]
pub struct KvTensor {
    /// Diagnostic name, e.g. `cache_k_l12`.
    pub name: String,

    /// Element type.
    pub dtype: Dtype,

    /// Length in elements.
    pub len: usize,

    /// Index of the owning buffer in the cache's buffer list.
    pub buf: usize,

    /// Byte offset of this tensor inside its buffer.
    pub offset: usize,
}

impl KvTensor {
    /// Size of this tensor in bytes.
    pub fn size_bytes(&self) -> usize {
        self.len * self.dtype.size_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtype_sizes_and_names() {
        assert_eq!(Dtype::F16.size_bytes(), 2);
        assert_eq!(Dtype::BF16.size_bytes(), 2);
        assert_eq!(Dtype::F32.size_bytes(), 4);
        assert_eq!(Dtype::parse("bf16"), Some(Dtype::BF16));
        assert_eq!(Dtype::parse("q4"), None);
        assert_eq!(format!("{}", Dtype::F32), "f32");
    }

    #[test]
    fn buffer_alloc_zeroes_and_reports_size() {
        let buf = BackendBuffer::alloc(MemoryDomain::Host, 64).unwrap();
        assert_eq!(buf.size_bytes(), 64);
        assert!(buf.bytes(0, 64).iter().all(|&b| b == 0));
    }

    #[test]
    fn buffer_clear_rezeroes() {
        let mut buf = BackendBuffer::alloc(MemoryDomain::Device(0), 16).unwrap();
        buf.bytes_mut(4, 4).copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(buf.bytes(4, 4), &[1, 2, 3, 4]);
        buf.clear();
        assert!(buf.bytes(0, 16).iter().all(|&b| b == 0));
    }

    #[test]
    fn tensor_handle_size() {
        let t = KvTensor {
            name: "cache_k_l0".to_string(),
            dtype: Dtype::F16,
            len: 128,
            buf: 0,
            offset: 256,
        };
        assert_eq!(t.size_bytes(), 256);
    }

    #[test]
    fn domain_display() {
        assert_eq!(format!("{}", MemoryDomain::Host), "host");
        assert_eq!(format!("{}", MemoryDomain::Device(2)), "dev2");
    }
}
