use serde::{Deserialize, Serialize};

/// Splits units across `shards` processes by FNV-1a hash of their name
/// (e.g. `"{cluster}/{namespace}"`). With one shard every unit is owned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardPlanner {
    shards: u32,
    shard_id: u32,
}

impl ShardPlanner {
    /// Fails unless `shards >= 1` and `shard_id < shards`.
    pub fn new(shards: u32, shard_id: u32) -> anyhow::Result<Self> {
        if shards == 0 {
            anyhow::bail!("shard count must be at least 1");
        }
        if shard_id >= shards {
            anyhow::bail!("shard id {} out of range for {} shards", shard_id, shards);
        }
        Ok(Self { shards, shard_id })
    }

    pub fn single() -> Self { Self { shards: 1, shard_id: 0 } }

    pub fn shards(&self) -> u32 { self.shards }
    pub fn shard_id(&self) -> u32 { self.shard_id }

    pub fn bucket(&self, name: &str) -> u32 {
        if self.shards <= 1 { return 0; }
        let mut h: u64 = 0xcbf29ce484222325; // 64-bit FNV-1a offset
        for b in name.as_bytes() { h ^= *b as u64; h = h.wrapping_mul(0x100000001b3); }
        (h % self.shards as u64) as u32
    }

    pub fn owns(&self, name: &str) -> bool { self.bucket(name) == self.shard_id }
}

impl Default for ShardPlanner {
    fn default() -> Self { Self::single() }
}
