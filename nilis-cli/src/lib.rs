use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use http::Uri;
use nilis_pb::{Key, Value, store_client::StoreClient};
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tonic::{Code, Request};
use tracing::debug;

#[derive(clap::Parser, Clone, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct NilisCli {
    #[command(subcommand)]
    pub command: NilisCommands,
    #[clap(flatten)]
    pub conn: ConnectionArgs,
}

#[derive(clap::Subcommand, Clone, Debug)]
pub enum NilisCommands {
    /// Print the value stored under a key
    #[clap(aliases = &["g"])]
    Get { key: String },
    /// Store a value under a key
    #[clap(aliases = &["s"])]
    Set {
        key: String,
        /// File holding the raw value, or `-` for stdin. Example: `cat v.bin | nilis-cli set k -`
        value: clap_stdin::FileOrStdin,
    },
    /// Remove a key
    #[clap(aliases = &["d", "del"])]
    Delete { key: String },
}

#[derive(clap::Args, Debug, Clone)]
pub struct ConnectionArgs {
    /// Node to send the request to
    #[arg(
        short,
        long,
        global = true,
        default_value = "http://127.0.0.1:6226"
    )]
    pub grpc_url: Uri,
    /// Request deadline in milliseconds
    #[arg(long, global = true)]
    pub timeout_ms: Option<u64>,
    /// PEM CA bundle that signed the node's certificate
    #[arg(long, global = true)]
    pub tls_ca: Option<PathBuf>,
    /// PEM client certificate, for nodes that require one
    #[arg(long, global = true, requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,
    #[arg(long, global = true, requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,
}

impl ConnectionArgs {
    pub async fn connect(&self) -> anyhow::Result<StoreClient<Channel>> {
        let mut endpoint = Endpoint::from(self.grpc_url.clone());
        if let Some(tls) = self.tls_config().await? {
            endpoint = endpoint.tls_config(tls)?;
        }
        if let Some(timeout) = self.timeout() {
            endpoint = endpoint.connect_timeout(timeout);
        }
        let channel = endpoint
            .connect()
            .await
            .with_context(|| format!("failed to connect to {}", self.grpc_url))?;
        Ok(StoreClient::new(channel))
    }

    /// TLS settings for `https` URLs; `None` for plain `http`.
    async fn tls_config(&self) -> anyhow::Result<Option<ClientTlsConfig>> {
        if self.grpc_url.scheme_str() != Some("https") {
            return Ok(None);
        }
        let mut tls = ClientTlsConfig::new();
        if let Some(ca) = &self.tls_ca {
            let pem = read_pem(ca).await?;
            tls = tls.ca_certificate(Certificate::from_pem(pem));
        }
        if let (Some(cert), Some(key)) = (&self.tls_cert, &self.tls_key) {
            let identity = Identity::from_pem(read_pem(cert).await?, read_pem(key).await?);
            tls = tls.identity(identity);
        }
        Ok(Some(tls))
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    fn request<T>(&self, message: T) -> Request<T> {
        let mut request = Request::new(message);
        if let Some(timeout) = self.timeout() {
            request.set_timeout(timeout);
        }
        request
    }
}

async fn read_pem(path: &Path) -> anyhow::Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))
}

/// Raw bytes of a `set` value; no text decoding is applied.
pub fn read_value(value: clap_stdin::FileOrStdin) -> anyhow::Result<Bytes> {
    let mut buf = Vec::new();
    value
        .into_reader()
        .context("failed to open value")?
        .read_to_end(&mut buf)
        .context("failed to read value")?;
    Ok(Bytes::from(buf))
}

pub async fn run(cli: NilisCli) -> anyhow::Result<()> {
    let conn = &cli.conn;
    debug!("use option {cli:?}");
    let mut client = conn.connect().await?;
    match cli.command {
        NilisCommands::Get { key } => {
            let resp = client.get(conn.request(Key { key: key.clone() })).await;
            match resp {
                Ok(resp) => {
                    let mut out = std::io::stdout().lock();
                    out.write_all(&resp.into_inner().value)?;
                    out.flush()?;
                }
                Err(status) if status.code() == Code::NotFound => {
                    anyhow::bail!("key {key} not found");
                }
                Err(status) => return Err(status).context("get failed"),
            }
        }
        NilisCommands::Set { key, value } => {
            let value = read_value(value)?;
            client
                .set(conn.request(Value { key, value }))
                .await
                .context("set failed")?;
        }
        NilisCommands::Delete { key } => {
            client
                .delete(conn.request(Key { key }))
                .await
                .context("delete failed")?;
        }
    }
    Ok(())
}
