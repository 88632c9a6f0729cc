//! Hashing utilities
//!
//! - BLAKE3 truncated to 20 bytes for content addressing
//! - Key prefixes to spread objects across storage partitions

use blake3::Hasher;

/// Length in bytes of a content hash
pub const HASH_LEN: usize = 20;

/// Compute the truncated BLAKE3 digest of data
pub fn content_hash(data: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = ContentHasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Compute the content hash incrementally (for streaming)
#[derive(Clone)]
pub struct ContentHasher {
    hasher: Hasher,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self {
            hasher: Hasher::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize(&self) -> [u8; HASH_LEN] {
        let hash = self.hasher.finalize();
        let mut out = [0u8; HASH_LEN];
        out.copy_from_slice(&hash.as_bytes()[..HASH_LEN]);
        out
    }
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Directory prefix for an object key: the first 4 hex characters of the id
pub fn blob_prefix(hex_id: &str) -> &str {
    let end = hex_id.len().min(4);
    &hex_id[..end]
}
