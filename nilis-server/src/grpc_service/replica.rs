use std::sync::Arc;

use nilis_pb::{ApplyResponse, Mutation as MutationMsg, replica_server::Replica};
use nilis_storage::{ApplyOutcome, Mutation, StorageEngine};
use tonic::{Request, Response, Status};
use tracing::{debug, error};

use crate::dispatcher::NodeRole;
use crate::topology::ShardId;

/// Receives mutations shipped by the primary of this node's shard.
pub struct ReplicaService {
    engine: Arc<StorageEngine>,
    shard_id: ShardId,
    role: NodeRole,
}

impl ReplicaService {
    pub fn new(
        engine: Arc<StorageEngine>,
        shard_id: ShardId,
        role: NodeRole,
    ) -> Self {
        Self {
            engine,
            shard_id,
            role,
        }
    }
}

#[tonic::async_trait]
impl Replica for ReplicaService {
    async fn apply(
        &self,
        request: Request<MutationMsg>,
    ) -> Result<Response<ApplyResponse>, Status> {
        let msg = request.into_inner();
        if self.role != NodeRole::Replica {
            return Err(Status::failed_precondition(
                "node is not a replica",
            ));
        }
        if msg.shard_id != self.shard_id {
            return Err(Status::failed_precondition(format!(
                "node replicates shard {}, not {}",
                self.shard_id, msg.shard_id
            )));
        }
        if msg.key.is_empty() {
            return Err(Status::invalid_argument("key must not be empty"));
        }

        let seq = msg.seq;
        let mutation = if msg.is_delete() {
            Mutation::Delete {
                key: msg.key.into_bytes(),
            }
        } else {
            Mutation::Set {
                key: msg.key.into_bytes(),
                value: msg.value.to_vec(),
            }
        };
        let engine = self.engine.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            engine.apply_replicated(seq, &mutation)
        })
        .await
        .map_err(|e| Status::internal(e.to_string()))?
        .map_err(|e| {
            error!(seq, error = %e, "failed to apply replicated mutation");
            Status::internal("internal storage error")
        })?;
        debug!(seq, ?outcome, "applied replicated mutation");
        Ok(Response::new(ApplyResponse {
            applied: outcome == ApplyOutcome::Applied,
        }))
    }
}
