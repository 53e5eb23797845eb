//! Cluster topology: the validated, immutable list of shards and replicas.
//!
//! Every node of a deployment must be built from the same shard list. The
//! topology orders shards by id, and that ordering is what the key router
//! indexes into, so ids do not have to be contiguous.

use std::collections::HashSet;
use std::net::SocketAddrV4;

use serde::{Deserialize, Serialize};

pub type ShardId = u64;

/// Shard entry as declared in configuration, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawShard {
    /// Signed so that a negative id reaches validation instead of the parser.
    pub id: i64,
    pub address: String,
    #[serde(default)]
    pub replicas: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replica {
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    pub id: ShardId,
    /// Address of the shard primary.
    pub address: String,
    pub replicas: Vec<Replica>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    #[error("shard list should contain at least one shard")]
    Empty,
    #[error("shard id must be non-negative: {0}")]
    NegativeShardId(i64),
    #[error("shard address cannot be empty for shard id: {0}")]
    EmptyShardAddress(ShardId),
    #[error("shard address `{address}` does not follow ip:port format for shard id: {id}")]
    InvalidShardAddress { id: ShardId, address: String },
    #[error("duplicate shard id found: {0}")]
    DuplicateShardId(ShardId),
    #[error("duplicate shard address found for shard id {id}: {address}")]
    DuplicateShardAddress { id: ShardId, address: String },
    #[error("replica address cannot be empty for shard id: {0}")]
    EmptyReplicaAddress(ShardId),
    #[error("replica address `{address}` does not follow ip:port format for shard id: {id}")]
    InvalidReplicaAddress { id: ShardId, address: String },
    #[error("duplicate replica address found in shard id {id}: {address}")]
    DuplicateReplicaAddress { id: ShardId, address: String },
    #[error("number of shards must be a power of 2, got: {0}")]
    NotPowerOfTwo(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    shards: Vec<Shard>,
}

impl Topology {
    /// Validate a declared shard list in a single pass, stopping at the
    /// first violation.
    pub fn from_raw(raw: &[RawShard]) -> Result<Self, TopologyError> {
        if raw.is_empty() {
            return Err(TopologyError::Empty);
        }

        let mut ids = HashSet::with_capacity(raw.len());
        // primaries and replicas share one address space
        let mut addresses = HashSet::new();
        let mut shards = Vec::with_capacity(raw.len());

        for declared in raw {
            if declared.id < 0 {
                return Err(TopologyError::NegativeShardId(declared.id));
            }
            let id = declared.id as ShardId;
            if declared.address.is_empty() {
                return Err(TopologyError::EmptyShardAddress(id));
            }
            if !is_valid_address(&declared.address) {
                return Err(TopologyError::InvalidShardAddress {
                    id,
                    address: declared.address.clone(),
                });
            }
            if !ids.insert(id) {
                return Err(TopologyError::DuplicateShardId(id));
            }
            if !addresses.insert(declared.address.as_str()) {
                return Err(TopologyError::DuplicateShardAddress {
                    id,
                    address: declared.address.clone(),
                });
            }

            let mut replicas = Vec::with_capacity(declared.replicas.len());
            for replica in &declared.replicas {
                if replica.is_empty() {
                    return Err(TopologyError::EmptyReplicaAddress(id));
                }
                if !is_valid_address(replica) {
                    return Err(TopologyError::InvalidReplicaAddress {
                        id,
                        address: replica.clone(),
                    });
                }
                if !addresses.insert(replica.as_str()) {
                    return Err(TopologyError::DuplicateReplicaAddress {
                        id,
                        address: replica.clone(),
                    });
                }
                replicas.push(Replica {
                    address: replica.clone(),
                });
            }

            shards.push(Shard {
                id,
                address: declared.address.clone(),
                replicas,
            });
        }

        if !shards.len().is_power_of_two() {
            return Err(TopologyError::NotPowerOfTwo(shards.len()));
        }

        shards.sort_by_key(|s| s.id);
        Ok(Self { shards })
    }

    /// Topology of a node running with sharding disabled: one shard, owned
    /// by the node itself.
    pub fn single(address: impl Into<String>) -> Self {
        Self {
            shards: vec![Shard {
                id: 0,
                address: address.into(),
                replicas: Vec::new(),
            }],
        }
    }

    /// Shards in routing order (ascending id).
    #[inline]
    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    #[inline]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn get(&self, id: ShardId) -> Option<&Shard> {
        self.shards.iter().find(|s| s.id == id)
    }
}

/// Strict `a.b.c.d:port` with every octet in 0-255 and port in 1-65535.
pub fn is_valid_address(address: &str) -> bool {
    match address.parse::<SocketAddrV4>() {
        Ok(addr) => addr.port() != 0,
        Err(_) => false,
    }
}
