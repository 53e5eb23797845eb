//! TLS material for the gRPC server and for channels to peer nodes.
//!
//! Every node presents the same kind of certificate in both directions: as
//! a server to clients and peers, and as a client when it forwards requests
//! or ships mutations. With a CA configured, peers must present a
//! certificate signed by it (mutual TLS).

use std::path::{Path, PathBuf};

use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};

#[derive(thiserror::Error, Debug)]
pub enum TlsError {
    #[error("failed loading tls {what} from '{path}': {source}")]
    Read {
        what: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSettings {
    /// PEM certificate chain presented by this node.
    pub cert: PathBuf,
    /// PEM private key matching `cert`.
    pub key: PathBuf,
    /// PEM CA bundle. Verifies peers and enables client authentication.
    pub ca: Option<PathBuf>,
    /// Name checked against peer certificates instead of the peer host.
    pub domain: Option<String>,
}

impl TlsSettings {
    async fn load(what: &'static str, path: &Path) -> Result<Vec<u8>, TlsError> {
        tokio::fs::read(path).await.map_err(|source| TlsError::Read {
            what,
            path: path.to_path_buf(),
            source,
        })
    }

    async fn identity(&self) -> Result<Identity, TlsError> {
        let cert = Self::load("certificate", &self.cert).await?;
        let key = Self::load("key", &self.key).await?;
        Ok(Identity::from_pem(cert, key))
    }

    pub async fn server_config(&self) -> Result<ServerTlsConfig, TlsError> {
        let mut config = ServerTlsConfig::new().identity(self.identity().await?);
        if let Some(ca) = &self.ca {
            let ca = Self::load("ca certificate", ca).await?;
            config = config.client_ca_root(Certificate::from_pem(ca));
        }
        Ok(config)
    }

    /// Client side of node-to-node channels. Without a CA the node's own
    /// certificate is the only trusted root.
    pub async fn client_config(&self) -> Result<ClientTlsConfig, TlsError> {
        let root = match &self.ca {
            Some(ca) => Self::load("ca certificate", ca).await?,
            None => Self::load("certificate", &self.cert).await?,
        };
        let mut config = ClientTlsConfig::new()
            .ca_certificate(Certificate::from_pem(root))
            .identity(self.identity().await?);
        if let Some(domain) = &self.domain {
            config = config.domain_name(domain.clone());
        }
        Ok(config)
    }
}
