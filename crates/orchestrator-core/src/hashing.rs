//! Stable shard and partition hashing.
//!
//! The orchestrator fixes FNV-1a as its hash function: shard and partition
//! routing must be byte-for-byte reproducible across processes and over
//! time, so this is a compatibility contract, not an implementation detail.
//! Do not swap this for `std`'s `SipHash`-based default hasher — it is
//! randomly seeded per-process and would make routing non-deterministic.

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// FNV-1a over raw bytes.
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// `shardId(workflowId) = fnv32(workflowId) mod S`.
///
/// `shard_count` must be nonzero; a zero count has no valid owner and is a
/// caller configuration error, not something this function can recover from.
pub fn shard_id(workflow_id: &str, shard_count: u32) -> u32 {
    assert!(shard_count > 0, "shard_count must be nonzero");
    fnv1a_32(workflow_id.as_bytes()) % shard_count
}

/// `partitionHash(queueName) = fnv32(queueName) mod P`, where `P <= S`.
pub fn partition_hash(queue_name: &str, partition_count: u32) -> u32 {
    assert!(partition_count > 0, "partition_count must be nonzero");
    fnv1a_32(queue_name.as_bytes()) % partition_count
}

#[cfg(test)]
mod tests {
    use super::*;

    // Known FNV-1a 32-bit test vectors (empty string and "a").
    #[test]
    fn fnv1a_32_known_vectors() {
        assert_eq!(fnv1a_32(b""), 0x811c_9dc5);
        assert_eq!(fnv1a_32(b"a"), 0xe40c_292c);
    }

    #[test]
    fn shard_id_is_deterministic() {
        let a = shard_id("wf-123", 512);
        let b = shard_id("wf-123", 512);
        assert_eq!(a, b);
        assert!(a < 512);
    }

    #[test]
    fn shard_id_varies_with_shard_count() {
        let s512 = shard_id("wf-123", 512);
        let s1 = shard_id("wf-123", 1);
        assert_eq!(s1, 0);
        assert!(s512 < 512);
    }

    #[test]
    fn partition_hash_respects_bound() {
        for name in ["orders", "emails", "", "x".repeat(500).as_str()] {
            let p = partition_hash(name, 16);
            assert!(p < 16);
        }
    }

    #[test]
    #[should_panic(expected = "shard_count must be nonzero")]
    fn shard_id_rejects_zero_count() {
        shard_id("wf", 0);
    }
}
