use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use mobc::Manager;
use nilis_pb::{
    replica_client::ReplicaClient, store_client::StoreClient, Key, Mutation,
    Value, FORWARDED_HEADER,
};
use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, ClientTlsConfig, Uri};
use tonic::{Code, Request};
use tracing::debug;

use super::{ClusterTransport, ConnManager, PoolConfig, TransportError};

/// Builds tonic channels to one peer address for the connection pool.
#[derive(Debug)]
pub struct ChannelManager {
    uri: Uri,
    connect_timeout: Duration,
    tls: Option<ClientTlsConfig>,
}

impl ChannelManager {
    pub fn new(
        address: &str,
        connect_timeout: Duration,
        tls: Option<ClientTlsConfig>,
    ) -> Result<Self, TransportError> {
        let scheme = if tls.is_some() { "https" } else { "http" };
        let uri = Uri::from_str(&format!("{scheme}://{address}"))?;
        Ok(Self {
            uri,
            connect_timeout,
            tls,
        })
    }
}

#[async_trait::async_trait]
impl Manager for ChannelManager {
    type Connection = Channel;

    type Error = TransportError;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let mut endpoint =
            Channel::builder(self.uri.clone()).connect_timeout(self.connect_timeout);
        if let Some(tls) = &self.tls {
            endpoint = endpoint.tls_config(tls.clone())?;
        }
        let channel = endpoint.connect().await?;
        debug!("create new channel for '{:?}'", self.uri);
        Ok(channel)
    }

    async fn check(
        &self,
        conn: Self::Connection,
    ) -> Result<Self::Connection, Self::Error> {
        Ok(conn)
    }
}

/// [`ClusterTransport`] over the nilis gRPC services.
pub struct GrpcTransport {
    conn_manager: ConnManager<String, ChannelManager>,
}

impl GrpcTransport {
    /// Channels use TLS when `tls` is set.
    pub fn new(config: PoolConfig, tls: Option<ClientTlsConfig>) -> Self {
        let factory = move |address: &String, config: &PoolConfig| {
            ChannelManager::new(address, config.get_timeout, tls.clone())
        };
        Self {
            conn_manager: ConnManager::new(factory, config),
        }
    }

    async fn channel(&self, address: &str) -> Result<Channel, TransportError> {
        let conn = self.conn_manager.get(&address.to_string()).await?;
        Ok((*conn).clone())
    }
}

fn forwarded_request<T>(message: T, timeout: Duration) -> Request<T> {
    let mut request = Request::new(message);
    request.set_timeout(timeout);
    request
        .metadata_mut()
        .insert(FORWARDED_HEADER, MetadataValue::from_static("1"));
    request
}

async fn with_deadline<T, F>(
    timeout: Duration,
    call: F,
) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| TransportError::Timeout)?
}

#[async_trait::async_trait]
impl ClusterTransport for GrpcTransport {
    async fn get(
        &self,
        address: &str,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<Bytes>, TransportError> {
        with_deadline(timeout, async {
            let mut client = StoreClient::new(self.channel(address).await?);
            let request = forwarded_request(
                Key {
                    key: key.to_string(),
                },
                timeout,
            );
            match client.get(request).await {
                Ok(resp) => Ok(Some(resp.into_inner().value)),
                Err(status) if status.code() == Code::NotFound => Ok(None),
                Err(status) => Err(status.into()),
            }
        })
        .await
    }

    async fn set(
        &self,
        address: &str,
        key: &str,
        value: Bytes,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        with_deadline(timeout, async {
            let mut client = StoreClient::new(self.channel(address).await?);
            let request = forwarded_request(
                Value {
                    key: key.to_string(),
                    value,
                },
                timeout,
            );
            client.set(request).await?;
            Ok(())
        })
        .await
    }

    async fn delete(
        &self,
        address: &str,
        key: &str,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        with_deadline(timeout, async {
            let mut client = StoreClient::new(self.channel(address).await?);
            let request = forwarded_request(
                Key {
                    key: key.to_string(),
                },
                timeout,
            );
            client.delete(request).await?;
            Ok(())
        })
        .await
    }

    async fn apply(
        &self,
        address: &str,
        mutation: Mutation,
        timeout: Duration,
    ) -> Result<bool, TransportError> {
        with_deadline(timeout, async {
            let mut client = ReplicaClient::new(self.channel(address).await?);
            let mut request = Request::new(mutation);
            request.set_timeout(timeout);
            let resp = client.apply(request).await?;
            Ok(resp.into_inner().applied)
        })
        .await
    }
}
