use nilis_storage::StorageError;
use tonic::Status;

use crate::config::ConfigError;
use crate::tls::TlsError;
use crate::topology::ShardId;
use crate::transport::TransportError;

/// Per-request failure of the dispatch layer. A missing key is not an
/// error; it surfaces as `Ok(None)` from `get`.
#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    #[error("Invalid: {0}")]
    InvalidArgument(String),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Shard {shard} at {address} unavailable: {source}")]
    Unavailable {
        shard: ShardId,
        address: String,
        #[source]
        source: TransportError,
    },
    #[error("Remote shard {shard} replied: {status}")]
    Remote { shard: ShardId, status: Status },
    #[error("Request forwarded to shard {local} but owned by shard {owner}")]
    Misrouted { local: ShardId, owner: ShardId },
    #[error("Request cancelled before dispatch")]
    Cancelled,
    #[error("Internal: {0}")]
    Internal(String),
}

impl From<DispatchError> for tonic::Status {
    fn from(value: DispatchError) -> Self {
        match value {
            DispatchError::InvalidArgument(msg) => Status::invalid_argument(msg),
            // engine details stay in the logs
            DispatchError::Storage(_) | DispatchError::Internal(_) => {
                Status::internal("internal storage error")
            }
            DispatchError::Unavailable { shard, .. } => {
                Status::unavailable(format!("shard {shard} unavailable"))
            }
            DispatchError::Remote { status, .. } => status,
            DispatchError::Misrouted { .. } => {
                Status::failed_precondition(value.to_string())
            }
            DispatchError::Cancelled => Status::cancelled("request cancelled"),
        }
    }
}

/// Failure to bring a node up. Any of these aborts startup.
#[derive(thiserror::Error, Debug)]
pub enum NilisError {
    #[error("Failed to load configuration: {0}")]
    Env(#[from] envconfig::Error),
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("gRPC server error: {0}")]
    Server(#[from] tonic::transport::Error),
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),
    #[error("Reflection error: {0}")]
    Reflection(#[from] tonic_reflection::server::Error),
    #[error("Server task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
