//! Hashing utilities for usermesh
//!
//! BLAKE3 spreads cache identifiers over lock shards so unrelated keys never
//! serialize on the same mutex.

/// Compute shard ID for a key
pub fn shard_key(key: &str, num_shards: u64) -> u64 {
    if num_shards <= 1 {
        return 0;
    }
    let hash = blake3::hash(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash.as_bytes()[0..8]);
    u64::from_le_bytes(prefix) % num_shards
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_key_is_stable_and_bounded() {
        for i in 0..1000 {
            let key = format!("user:{}", i);
            let shard = shard_key(&key, 16);
            assert!(shard < 16);
            assert_eq!(shard, shard_key(&key, 16));
        }
        assert_eq!(shard_key("user:1", 1), 0);
    }

    #[test]
    fn test_shard_key_spreads() {
        let mut seen = std::collections::HashSet::new();
        for i in 0..256 {
            seen.insert(shard_key(&format!("user:{}", i), 16));
        }
        assert!(seen.len() > 8);
    }
}
