use xxhash_rust::xxh64::xxh64;

/// Computes the deterministic owner hash over an owner name.
///
/// The same name always hashes to the same value, which is what lets a page
/// carry its owner identity independently of its section header.
pub fn owner_hash64(bytes: &[u8]) -> u64 {
    xxh64(bytes, 0)
}
