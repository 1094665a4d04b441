//! Seed derivation for reproducible sub-streams.

/// Derive an independent sub-seed for trial `index` of a run seeded with `seed`.
///
/// SplitMix64 over both inputs, so neighbouring indices give unrelated `StdRng` streams.
#[must_use]
pub fn derive_seed(seed: u64, index: u64) -> u64 {
    splitmix64(seed ^ splitmix64(index))
}

/// Derive a sub-seed from a label (FNV-1a over the bytes, then SplitMix64).
///
/// Stable across platforms; not cryptographic.
#[must_use]
pub fn labeled_seed(seed: u64, label: &str) -> u64 {
    let mut h: u64 = 14695981039346656037u64;
    for b in label.as_bytes() {
        h ^= *b as u64;
        h = h.wrapping_mul(1099511628211u64);
    }
    splitmix64(seed ^ h)
}

#[inline]
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
