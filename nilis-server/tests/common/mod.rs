#![allow(dead_code)]

use std::time::Duration;

use nilis_pb::store_client::StoreClient;
use nilis_server::topology::RawShard;
use nilis_server::{NilisConfig, NilisNode, start_server};
use tempfile::TempDir;
use tonic::transport::Channel;

pub fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port");
    listener.local_addr().expect("Failed to get local addr").port()
}

pub fn loopback(port: u16) -> String {
    format!("127.0.0.1:{port}")
}

/// Config for a node listening on loopback `port` with its database in `dir`.
pub fn node_config(dir: &TempDir, port: u16) -> NilisConfig {
    NilisConfig {
        listen_port: port,
        bind_address: "127.0.0.1".into(),
        database_location: dir
            .path()
            .join(format!("node-{port}.db"))
            .to_string_lossy()
            .into_owned(),
        sync_writes: false,
        forward_timeout_ms: 2000,
        replication_timeout_ms: 500,
        ..Default::default()
    }
}

pub fn tls_fixture(name: &str) -> String {
    format!("{}/tests/fixtures/tls/{name}", env!("CARGO_MANIFEST_DIR"))
}

/// `conf` with TLS on, using the test certificate signed by the test CA.
pub fn with_tls(conf: NilisConfig) -> NilisConfig {
    NilisConfig {
        use_tls: true,
        tls_cert: Some(tls_fixture("node.pem")),
        tls_key: Some(tls_fixture("node.key")),
        tls_ca: Some(tls_fixture("ca.pem")),
        ..conf
    }
}

pub fn sharded_config(
    dir: &TempDir,
    port: u16,
    shard_id: u64,
    shards: &[RawShard],
) -> NilisConfig {
    NilisConfig {
        sharding_enabled: true,
        shard_id,
        shards: Some(serde_json::to_string(shards).unwrap()),
        ..node_config(dir, port)
    }
}

/// `count` primaries without replicas, shard ids `0..count`.
pub struct TestCluster {
    pub dir: TempDir,
    pub shards: Vec<RawShard>,
    pub nodes: Vec<NilisNode>,
}

impl TestCluster {
    pub fn layout(count: usize) -> Vec<RawShard> {
        (0..count)
            .map(|id| RawShard {
                id: id as i64,
                address: loopback(find_free_port()),
                replicas: vec![],
            })
            .collect()
    }

    pub async fn start(count: usize) -> Self {
        let dir = TempDir::new().unwrap();
        let shards = Self::layout(count);
        let mut nodes = Vec::with_capacity(count);
        for shard in &shards {
            let port = port_of(&shard.address);
            let conf = sharded_config(&dir, port, shard.id as u64, &shards);
            nodes.push(start_server(&conf).await.unwrap());
        }
        Self { dir, shards, nodes }
    }

    pub async fn client(&self, index: usize) -> StoreClient<Channel> {
        client(&self.shards[index].address).await
    }

    pub async fn close(self) {
        for node in self.nodes {
            node.close().await.unwrap();
        }
    }
}

pub fn port_of(address: &str) -> u16 {
    address.rsplit(':').next().unwrap().parse().unwrap()
}

pub async fn client(address: &str) -> StoreClient<Channel> {
    StoreClient::connect(format!("http://{address}"))
        .await
        .unwrap()
}

/// Poll `check` until it holds or a few seconds pass.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}
