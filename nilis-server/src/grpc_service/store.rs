use std::sync::Arc;

use nilis_pb::{Empty, Key, Value, store_server::Store};
use tonic::{Request, Response, Status};
use tracing::{debug, error};

use crate::context::RequestContext;
use crate::dispatcher::KvDispatch;
use crate::error::DispatchError;

/// Client facing `Store` service over any [`KvDispatch`].
pub struct StoreService<D> {
    dispatcher: Arc<D>,
}

impl<D: KvDispatch> StoreService<D> {
    pub fn new(dispatcher: Arc<D>) -> Self {
        Self { dispatcher }
    }
}

fn to_status(key: &str, err: DispatchError) -> Status {
    match &err {
        DispatchError::Storage(_) | DispatchError::Internal(_) => {
            error!(key = %key, error = %err, "failed to access the database")
        }
        _ => debug!(key = %key, error = %err, "request failed"),
    }
    err.into()
}

#[tonic::async_trait]
impl<D: KvDispatch> Store for StoreService<D> {
    async fn set(
        &self,
        request: Request<Value>,
    ) -> Result<Response<Empty>, Status> {
        let ctx = RequestContext::from_metadata(request.metadata());
        let Value { key, value } = request.into_inner();
        debug!(key = %key, forwarded = ctx.forwarded, "handling set");
        self.dispatcher
            .set(ctx, key.clone(), value)
            .await
            .map_err(|e| to_status(&key, e))?;
        Ok(Response::new(Empty {}))
    }

    async fn get(
        &self,
        request: Request<Key>,
    ) -> Result<Response<Value>, Status> {
        let ctx = RequestContext::from_metadata(request.metadata());
        let key = request.into_inner().key;
        debug!(key = %key, forwarded = ctx.forwarded, "handling get");
        match self.dispatcher.get(ctx, key.clone()).await {
            Ok(Some(value)) => Ok(Response::new(Value { key, value })),
            Ok(None) => Err(Status::not_found(format!("key {key} not found"))),
            Err(e) => Err(to_status(&key, e)),
        }
    }

    async fn delete(
        &self,
        request: Request<Key>,
    ) -> Result<Response<Empty>, Status> {
        let ctx = RequestContext::from_metadata(request.metadata());
        let key = request.into_inner().key;
        debug!(key = %key, forwarded = ctx.forwarded, "handling delete");
        self.dispatcher
            .delete(ctx, key.clone())
            .await
            .map_err(|e| to_status(&key, e))?;
        Ok(Response::new(Empty {}))
    }
}
