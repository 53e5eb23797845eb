//! Decides, per request, whether the local engine serves it or the owning
//! primary does, and carries it out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use nilis_storage::{StorageEngine, StorageError};
use tracing::{debug, warn};

use crate::config::ClusterSettings;
use crate::context::RequestContext;
use crate::error::DispatchError;
use crate::replication::{
    ReplicatedMutation, ReplicatedOp, ReplicationPropagator,
};
use crate::router::KeyRouter;
use crate::topology::Shard;
use crate::transport::{ClusterTransport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Serves its shard and ships every committed write to the replicas.
    Primary,
    /// Holds a copy of one shard. Client calls go to the primary.
    Replica,
}

/// Get/Set/Delete as the gRPC surface sees them.
#[async_trait]
pub trait KvDispatch: Send + Sync + 'static {
    /// `Ok(None)` when the owning shard has no record for `key`.
    async fn get(
        &self,
        ctx: RequestContext,
        key: String,
    ) -> Result<Option<Bytes>, DispatchError>;

    async fn set(
        &self,
        ctx: RequestContext,
        key: String,
        value: Bytes,
    ) -> Result<(), DispatchError>;

    async fn delete(
        &self,
        ctx: RequestContext,
        key: String,
    ) -> Result<(), DispatchError>;
}

enum Route<'a> {
    Local,
    Remote(&'a Shard),
}

pub struct Dispatcher {
    engine: Arc<StorageEngine>,
    router: KeyRouter,
    local_shard: Shard,
    role: NodeRole,
    transport: Arc<dyn ClusterTransport>,
    propagator: Option<Arc<ReplicationPropagator>>,
    forward_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        engine: Arc<StorageEngine>,
        settings: &ClusterSettings,
        transport: Arc<dyn ClusterTransport>,
        propagator: Option<Arc<ReplicationPropagator>>,
        forward_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            router: KeyRouter::new(settings.topology.clone()),
            local_shard: settings.local_shard.clone(),
            role: settings.role,
            transport,
            propagator,
            forward_timeout,
        }
    }

    pub fn local_shard(&self) -> &Shard {
        &self.local_shard
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn router(&self) -> &KeyRouter {
        &self.router
    }

    pub fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }

    fn resolve(
        &self,
        ctx: &RequestContext,
        key: &str,
    ) -> Result<Route<'_>, DispatchError> {
        if ctx.is_expired() {
            return Err(DispatchError::Cancelled);
        }
        if key.is_empty() {
            return Err(DispatchError::InvalidArgument(
                "key must not be empty".into(),
            ));
        }
        let owner = self.router.route(key);
        if self.role == NodeRole::Primary && owner.id == self.local_shard.id {
            return Ok(Route::Local);
        }
        if ctx.forwarded {
            return Err(DispatchError::Misrouted {
                local: self.local_shard.id,
                owner: owner.id,
            });
        }
        Ok(Route::Remote(owner))
    }

    /// Run `op` against the engine on the blocking pool.
    async fn run_local<T, F>(&self, op: F) -> Result<T, DispatchError>
    where
        T: Send + 'static,
        F: FnOnce(
                &StorageEngine,
                Option<&ReplicationPropagator>,
            ) -> Result<T, StorageError>
            + Send
            + 'static,
    {
        let engine = self.engine.clone();
        let propagator = self.propagator.clone();
        let result =
            tokio::task::spawn_blocking(move || op(&engine, propagator.as_deref()))
                .await
                .map_err(|e| DispatchError::Internal(e.to_string()))?;
        Ok(result?)
    }

    fn remote_error(&self, shard: &Shard, err: TransportError) -> DispatchError {
        warn!(shard = shard.id, address = %shard.address, error = %err, "forwarding to shard failed");
        if err.is_unavailable() {
            return DispatchError::Unavailable {
                shard: shard.id,
                address: shard.address.clone(),
                source: err,
            };
        }
        match err {
            TransportError::GrpcError(status) => DispatchError::Remote {
                shard: shard.id,
                status,
            },
            source => DispatchError::Unavailable {
                shard: shard.id,
                address: shard.address.clone(),
                source,
            },
        }
    }
}

#[async_trait]
impl KvDispatch for Dispatcher {
    async fn get(
        &self,
        ctx: RequestContext,
        key: String,
    ) -> Result<Option<Bytes>, DispatchError> {
        match self.resolve(&ctx, &key)? {
            Route::Local => {
                self.run_local(move |engine, _| {
                    Ok(engine.get(key.as_bytes())?.map(Bytes::from))
                })
                .await
            }
            Route::Remote(shard) => {
                debug!(key = %key, shard = shard.id, "forwarding get");
                let timeout = ctx.effective_timeout(self.forward_timeout);
                self.transport
                    .get(&shard.address, &key, timeout)
                    .await
                    .map_err(|e| self.remote_error(shard, e))
            }
        }
    }

    async fn set(
        &self,
        ctx: RequestContext,
        key: String,
        value: Bytes,
    ) -> Result<(), DispatchError> {
        match self.resolve(&ctx, &key)? {
            Route::Local => {
                let shard_id = self.local_shard.id;
                self.run_local(move |engine, propagator| {
                    let seq = engine.set(key.as_bytes(), &value)?;
                    // queued from the blocking task so a dropped client
                    // call cannot skip it
                    if let Some(propagator) = propagator {
                        propagator.propagate(ReplicatedMutation {
                            shard_id,
                            seq,
                            key,
                            op: ReplicatedOp::Set(value),
                        });
                    }
                    Ok(())
                })
                .await
            }
            Route::Remote(shard) => {
                debug!(key = %key, shard = shard.id, "forwarding set");
                let timeout = ctx.effective_timeout(self.forward_timeout);
                self.transport
                    .set(&shard.address, &key, value, timeout)
                    .await
                    .map_err(|e| self.remote_error(shard, e))
            }
        }
    }

    async fn delete(
        &self,
        ctx: RequestContext,
        key: String,
    ) -> Result<(), DispatchError> {
        match self.resolve(&ctx, &key)? {
            Route::Local => {
                let shard_id = self.local_shard.id;
                self.run_local(move |engine, propagator| {
                    let seq = engine.delete(key.as_bytes())?;
                    if let Some(propagator) = propagator {
                        propagator.propagate(ReplicatedMutation {
                            shard_id,
                            seq,
                            key,
                            op: ReplicatedOp::Delete,
                        });
                    }
                    Ok(())
                })
                .await
            }
            Route::Remote(shard) => {
                debug!(key = %key, shard = shard.id, "forwarding delete");
                let timeout = ctx.effective_timeout(self.forward_timeout);
                self.transport
                    .delete(&shard.address, &key, timeout)
                    .await
                    .map_err(|e| self.remote_error(shard, e))
            }
        }
    }
}
