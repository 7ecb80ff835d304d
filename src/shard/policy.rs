//! Shard Ownership Policy
//!
//! Maps a peer to the one shard allowed to hold its connection state.

use crate::domain::ports::{NodeId, ShardId, ShardPolicy};
use crate::error::{Error, Result};

/// Multiplier from the jump consistent hash paper (a 64-bit LCG step)
const JUMP_MULTIPLIER: u64 = 2_862_933_555_777_941_757;

/// Jump consistent hash (Lamping & Veach) of `key` into `buckets` buckets.
///
/// Growing the bucket count from `n` to `n + 1` only moves keys into the new
/// bucket, never between existing ones.
#[inline]
pub fn jump_consistent_hash(mut key: u64, buckets: u32) -> u32 {
    let mut b: i64 = -1;
    let mut j: i64 = 0;
    while j < buckets as i64 {
        b = j;
        key = key.wrapping_mul(JUMP_MULTIPLIER).wrapping_add(1);
        j = ((b + 1) as f64 * ((1u64 << 31) as f64 / ((key >> 33) + 1) as f64)) as i64;
    }
    b as u32
}

/// Places nodes onto shards with jump consistent hashing of the node id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JumpHashPolicy {
    shard_count: u32,
}

impl JumpHashPolicy {
    /// Create a policy over `shard_count` shards
    pub fn new(shard_count: usize) -> Result<Self> {
        if shard_count == 0 {
            return Err(Error::Configuration("shard count must be at least 1".into()));
        }
        let shard_count = u32::try_from(shard_count).map_err(|_| {
            Error::Configuration(format!("shard count {} is too large", shard_count))
        })?;
        Ok(Self { shard_count })
    }
}

impl ShardPolicy for JumpHashPolicy {
    #[inline]
    fn shard_for(&self, node: NodeId) -> ShardId {
        // sign-extend so negative ids hash like their 64-bit two's complement
        jump_consistent_hash(node.get() as i64 as u64, self.shard_count) as ShardId
    }

    fn shard_count(&self) -> usize {
        self.shard_count as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_shards_rejected() {
        assert!(matches!(JumpHashPolicy::new(0), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_shard_for_is_deterministic() {
        let policy = JumpHashPolicy::new(8).unwrap();
        for id in -50..500 {
            let node = NodeId(id);
            let first = policy.shard_for(node);
            for _ in 0..3 {
                assert_eq!(policy.shard_for(node), first);
            }
            // an independently built policy agrees
            assert_eq!(JumpHashPolicy::new(8).unwrap().shard_for(node), first);
        }
    }

    #[test]
    fn test_shard_for_within_bounds() {
        for count in 1..=16 {
            let policy = JumpHashPolicy::new(count).unwrap();
            for id in 0..200 {
                assert!(policy.shard_for(NodeId(id)) < count);
            }
        }
    }

    #[test]
    fn test_single_shard_owns_everything() {
        let policy = JumpHashPolicy::new(1).unwrap();
        for id in [-7, 0, 1, 99, i32::MAX, i32::MIN] {
            assert_eq!(policy.shard_for(NodeId(id)), 0);
        }
    }

    #[test]
    fn test_growing_only_moves_into_new_shard() {
        for count in 1..12u32 {
            for key in 0..1000u64 {
                let before = jump_consistent_hash(key, count);
                let after = jump_consistent_hash(key, count + 1);
                assert!(after == before || after == count);
            }
        }
    }

    #[test]
    fn test_every_shard_gets_nodes() {
        let policy = JumpHashPolicy::new(4).unwrap();
        let mut seen = [0usize; 4];
        for id in 0..1000 {
            seen[policy.shard_for(NodeId(id))] += 1;
        }
        assert!(seen.iter().all(|&n| n > 100), "skewed placement: {:?}", seen);
    }
}
