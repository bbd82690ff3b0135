// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

// Bloom filter policy over u32 keys.
//
// Fixed at 16 bits per key. Uses double hashing (one base hash, probe deltas
// derived from it) instead of k independent hash functions. The base hash is
// a Murmur-style 32-bit mixer over the 4 little-endian key bytes.

const BITS_PER_KEY: u32 = 16;
const HASH_SEED: u32 = 0xbc9f_1d34;

/// Number of probe bits per lookup, derived from `BITS_PER_KEY`.
fn hash_fn_count() -> u32 {
    let k = (f64::from(BITS_PER_KEY) * std::f64::consts::LN_2).round() as u32;
    k.clamp(1, 30)
}

/// 32-bit Murmur-like mixer over a single little-endian u32 key.
fn bloom_hash(key: u32) -> u32 {
    const M: u32 = 0xc6a4_a793;

    let mut h = HASH_SEED ^ 4u32.wrapping_mul(M);
    h = h.wrapping_add(key);
    h = h.wrapping_mul(M);
    h ^= h >> 16;
    h
}

/// Builds a bloom filter over `keys`. The returned buffer is
/// `ceil(n * 16 / 8)` data bytes followed by one trailing byte holding `k`.
#[must_use]
pub fn create_filter(keys: &[u32]) -> Vec<u8> {
    let k = hash_fn_count();

    let mut bits = keys.len() as u64 * u64::from(BITS_PER_KEY);
    bits = bits.div_ceil(8) * 8;
    let bits = bits.max(8); // at least one byte, so `% bits` below is well-defined
    let bytes = (bits / 8) as usize;

    let mut filter = vec![0u8; bytes + 1];

    for &key in keys {
        let h = bloom_hash(key);
        let delta = h.rotate_right(17);
        let mut h = h;

        for _ in 0..k {
            let idx = (h as u64 % bits) as usize;
            filter[idx / 8] |= 1 << (idx % 8);
            h = h.wrapping_add(delta);
        }
    }

    // Trailing byte: number of probes used, so future filters with a
    // different k remain self-describing.
    #[allow(clippy::cast_possible_truncation)]
    {
        filter[bytes] = k as u8;
    }

    filter
}

/// Returns `true` if `key` may be a member of `filter`. Never false-negative.
#[must_use]
pub fn key_may_match(key: u32, filter: &[u8]) -> bool {
    if filter.len() < 2 {
        return false;
    }

    let bytes = filter.len() - 1;
    let bits = (bytes as u64) * 8;
    let k = filter[bytes];

    if k > 30 {
        // Forward compatibility: treat as a filter format we don't
        // understand, and conservatively report a match.
        return true;
    }

    let mut h = bloom_hash(key);
    let delta = h.rotate_right(17);

    for _ in 0..k {
        let idx = (h as u64 % bits) as usize;
        if filter[idx / 8] & (1 << (idx % 8)) == 0 {
            return false;
        }
        h = h.wrapping_add(delta);
    }

    true
}
