use std::sync::Arc;

use crate::topology::{Shard, Topology};

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// 64-bit FNV-1a over the raw key bytes.
///
/// Every node must route with the same function; changing it re-homes keys.
#[inline]
pub fn hash_key(key: &[u8]) -> u64 {
    key.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Maps keys to their owning shard. Pure: no I/O and no failure mode, since
/// a validated topology is never empty.
#[derive(Debug, Clone)]
pub struct KeyRouter {
    topology: Arc<Topology>,
}

impl KeyRouter {
    pub fn new(topology: Arc<Topology>) -> Self {
        Self { topology }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Position of the owning shard in the id-ordered shard list.
    #[inline]
    pub fn shard_index(&self, key: &str) -> usize {
        let count = self.topology.shard_count() as u64;
        (hash_key(key.as_bytes()) % count) as usize
    }

    #[inline]
    pub fn route(&self, key: &str) -> &Shard {
        &self.topology.shards()[self.shard_index(key)]
    }
}
