//! MurmurHash64A
//!
//! 64-bit Murmur2 variant used as the primary bucket hash by the index
//! backends. Keys are hashed as their 8 little-endian bytes.

/// Seed shared by all backends
pub const DEFAULT_SEED: u64 = 0xdead_beef;

const M: u64 = 0xc6a4_a793_5bd1_e995;
const R: u32 = 47;

/// Hash an arbitrary byte string
pub fn murmur64a(data: &[u8], seed: u64) -> u64 {
    let mut h = seed ^ (data.len() as u64).wrapping_mul(M);

    let mut chunks = data.chunks_exact(8);
    for chunk in &mut chunks {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(chunk);
        let mut k = u64::from_le_bytes(buf);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h ^= k;
        h = h.wrapping_mul(M);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        for (i, b) in tail.iter().enumerate() {
            h ^= u64::from(*b) << (8 * i);
        }
        h = h.wrapping_mul(M);
    }

    h ^= h >> R;
    h = h.wrapping_mul(M);
    h ^= h >> R;
    h
}

/// Hash a record key with the default seed
#[inline]
pub fn hash_key(key: u64) -> u64 {
    murmur64a(&key.to_le_bytes(), DEFAULT_SEED)
}
