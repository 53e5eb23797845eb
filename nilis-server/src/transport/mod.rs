//! Node-to-node calls: forwarding client requests to a shard primary and
//! shipping committed mutations to replicas.

mod conn;
mod grpc;
#[cfg(test)]
pub(crate) mod mock;

use std::time::Duration;

use bytes::Bytes;
use tonic::{Code, Status};

pub use conn::{ConnManager, PoolConfig};
pub use grpc::{ChannelManager, GrpcTransport};

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("gRPC error: {0}")]
    GrpcError(#[from] Status),
    #[error("gRPC connect error: {0}")]
    GrpcConnectError(#[from] tonic::transport::Error),
    #[error("Uri parsing error: {0}")]
    InvalidUrl(#[from] http::uri::InvalidUri),
    #[error("Timeout")]
    Timeout,
    #[error("Pool error: {0}")]
    PoolError(String),
}

impl TransportError {
    /// Whether the peer could not be reached in time, as opposed to the peer
    /// answering with an application status.
    pub fn is_unavailable(&self) -> bool {
        match self {
            TransportError::GrpcError(status) => matches!(
                status.code(),
                Code::Unavailable | Code::DeadlineExceeded
            ),
            _ => true,
        }
    }
}

impl From<mobc::Error<TransportError>> for TransportError {
    fn from(value: mobc::Error<TransportError>) -> Self {
        match value {
            mobc::Error::Inner(e) => e,
            mobc::Error::Timeout => TransportError::Timeout,
            mobc::Error::BadConn => {
                TransportError::PoolError("bad connection".into())
            }
            mobc::Error::PoolClosed => {
                TransportError::PoolError("pool closed".into())
            }
        }
    }
}

/// The cluster calls the core needs. Every call carries an explicit deadline.
#[async_trait::async_trait]
pub trait ClusterTransport: Send + Sync + 'static {
    /// `Ok(None)` when the remote primary has no record for `key`.
    async fn get(
        &self,
        address: &str,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<Bytes>, TransportError>;

    async fn set(
        &self,
        address: &str,
        key: &str,
        value: Bytes,
        timeout: Duration,
    ) -> Result<(), TransportError>;

    async fn delete(
        &self,
        address: &str,
        key: &str,
        timeout: Duration,
    ) -> Result<(), TransportError>;

    /// Ship a mutation to a replica. `Ok(false)` means the replica already
    /// held a newer version of the key.
    async fn apply(
        &self,
        address: &str,
        mutation: nilis_pb::Mutation,
        timeout: Duration,
    ) -> Result<bool, TransportError>;
}
