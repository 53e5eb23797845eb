pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
mod grpc_service;
pub mod replication;
pub mod router;
pub mod tls;
pub mod topology;
pub mod transport;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use nilis_pb::{replica_server::ReplicaServer, store_server::StoreServer};
use nilis_storage::StorageEngine;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub use config::{ClusterSettings, ConfigError, NilisConfig};
pub use dispatcher::{Dispatcher, KvDispatch, NodeRole};
pub use error::{DispatchError, NilisError};
pub use grpc_service::{ReplicaService, StoreService};
pub use replication::ReplicationSnapshot;

use replication::ReplicationPropagator;
use transport::GrpcTransport;

const REPLICATION_GRACE: Duration = Duration::from_secs(5);

/// A running node: engine, dispatcher and gRPC server.
pub struct NilisNode {
    local_addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    propagator: Option<Arc<ReplicationPropagator>>,
    token: CancellationToken,
    server: Option<JoinHandle<Result<(), tonic::transport::Error>>>,
}

impl NilisNode {
    /// Address the gRPC server is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// `None` unless this node is a primary with replicas.
    pub fn replication_stats(&self) -> Option<ReplicationSnapshot> {
        self.propagator.as_ref().map(|p| p.stats())
    }

    /// Resolve when the gRPC server exits on its own.
    pub async fn stopped(&mut self) -> Result<(), NilisError> {
        match self.server.as_mut() {
            Some(handle) => {
                let result = handle.await;
                self.server = None;
                result??;
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Stop serving, flush replication and release the database.
    pub async fn close(mut self) -> Result<(), NilisError> {
        info!(addr = %self.local_addr, "shutting down node");
        self.token.cancel();
        if let Some(handle) = self.server.take() {
            match handle.await {
                Ok(Err(e)) => warn!(error = %e, "gRPC server stopped with error"),
                Err(e) => warn!(error = %e, "gRPC server task failed"),
                Ok(Ok(())) => {}
            }
        }
        if let Some(propagator) = self.propagator.take() {
            propagator.shutdown(REPLICATION_GRACE).await;
        }
        let engine = self.dispatcher.engine().clone();
        drop(self.dispatcher);
        match Arc::try_unwrap(engine) {
            Ok(engine) => engine.close()?,
            // still shared by an in-flight blocking task; closes on last drop
            Err(_) => warn!("storage engine still in use at shutdown"),
        }
        info!("node stopped");
        Ok(())
    }
}

/// Validate `conf`, open the engine and start serving. Returns once the
/// listener is bound. Everything that can fail runs before the engine is
/// opened, so a failed start leaves the database closed.
pub async fn start_server(conf: &NilisConfig) -> Result<NilisNode, NilisError> {
    let settings = conf.validate()?;
    let listen_addr = conf.listen_addr()?;
    let tls = conf.tls_settings()?;

    let mut builder = tonic::transport::Server::builder();
    let client_tls = match &tls {
        Some(tls) => {
            builder = builder.tls_config(tls.server_config().await?)?;
            info!(cert = %tls.cert.display(), mutual = tls.ca.is_some(), "tls enabled");
            Some(tls.client_config().await?)
        }
        None => None,
    };
    let reflection = if conf.reflection_enabled {
        Some(
            tonic_reflection::server::Builder::configure()
                .register_encoded_file_descriptor_set(nilis_pb::FILE_DESCRIPTOR_SET)
                .build_v1()?,
        )
    } else {
        None
    };
    let listener = match tokio::net::TcpListener::bind(listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %listen_addr, error = %e, "failed to bind");
            return Err(e.into());
        }
    };
    let local_addr = listener.local_addr()?;

    let engine = Arc::new(StorageEngine::open(conf.storage_config())?);
    info!(
        shard = settings.local_shard.id,
        shards = settings.topology.shard_count(),
        role = ?settings.role,
        db = %conf.database_location,
        "storage engine opened"
    );

    let transport = Arc::new(GrpcTransport::new(conf.pool_config(), client_tls));
    let propagator = match settings.role {
        NodeRole::Primary if !settings.local_shard.replicas.is_empty() => {
            Some(Arc::new(ReplicationPropagator::start(
                &settings.local_shard,
                engine.clone(),
                transport.clone(),
                conf.replication_config(),
            )))
        }
        _ => None,
    };
    let dispatcher = Arc::new(Dispatcher::new(
        engine.clone(),
        &settings,
        transport,
        propagator.clone(),
        conf.forward_timeout(),
    ));

    let router = builder
        .add_optional_service(reflection)
        .add_service(StoreServer::new(StoreService::new(dispatcher.clone())))
        .add_service(ReplicaServer::new(ReplicaService::new(
            engine,
            settings.local_shard.id,
            settings.role,
        )));

    let token = CancellationToken::new();
    let server = tokio::spawn(router.serve_with_incoming_shutdown(
        TcpListenerStream::new(listener),
        token.clone().cancelled_owned(),
    ));
    info!(addr = %local_addr, "nilis listening");

    Ok(NilisNode {
        local_addr,
        dispatcher,
        propagator,
        token,
        server: Some(server),
    })
}
