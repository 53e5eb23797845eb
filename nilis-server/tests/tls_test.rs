mod common;

use bytes::Bytes;
use common::{
    TestCluster, find_free_port, loopback, node_config, port_of, sharded_config,
    tls_fixture, with_tls,
};
use nilis_pb::store_client::StoreClient;
use nilis_pb::{Key, Value};
use nilis_server::start_server;
use tempfile::TempDir;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity};

async fn tls_client(address: &str) -> StoreClient<Channel> {
    let read = |name: &str| std::fs::read(tls_fixture(name)).unwrap();
    let tls = ClientTlsConfig::new()
        .ca_certificate(Certificate::from_pem(read("ca.pem")))
        .identity(Identity::from_pem(read("node.pem"), read("node.key")));
    let channel = Channel::from_shared(format!("https://{address}"))
        .unwrap()
        .tls_config(tls)
        .unwrap()
        .connect()
        .await
        .unwrap();
    StoreClient::new(channel)
}

#[tokio::test(flavor = "multi_thread")]
async fn forwarding_works_between_tls_nodes() {
    let dir = TempDir::new().unwrap();
    let shards = TestCluster::layout(2);
    let mut nodes = Vec::new();
    for shard in &shards {
        let port = port_of(&shard.address);
        let conf = with_tls(sharded_config(&dir, port, shard.id as u64, &shards));
        nodes.push(start_server(&conf).await.unwrap());
    }
    assert_eq!(nodes[1].dispatcher().router().route("user:42").id, 0);

    let mut via_other = tls_client(&shards[1].address).await;
    via_other
        .set(Value {
            key: "user:42".into(),
            value: Bytes::from_static(b"secure"),
        })
        .await
        .unwrap();
    let stored = nodes[0].dispatcher().engine().get(b"user:42").unwrap();
    assert_eq!(stored, Some(b"secure".to_vec()));

    let got = via_other
        .get(Key {
            key: "user:42".into(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(&got.value[..], b"secure");

    for node in nodes {
        node.close().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn plaintext_clients_are_refused() {
    let dir = TempDir::new().unwrap();
    let port = find_free_port();
    let conf = with_tls(node_config(&dir, port));
    let node = start_server(&conf).await.unwrap();

    let plain = StoreClient::connect(format!("http://{}", loopback(port))).await;
    let refused = match plain {
        Ok(mut plain) => plain.get(Key { key: "k".into() }).await.is_err(),
        Err(_) => true,
    };
    assert!(refused);

    let mut secure = tls_client(&loopback(port)).await;
    let status = secure.get(Key { key: "k".into() }).await.unwrap_err();
    assert_eq!(status.code(), tonic::Code::NotFound);

    node.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn unreadable_certificate_fails_before_opening_storage() {
    let dir = TempDir::new().unwrap();
    let conf = nilis_server::NilisConfig {
        tls_key: Some(tls_fixture("missing.key")),
        ..with_tls(node_config(&dir, find_free_port()))
    };
    let err = start_server(&conf).await.err().unwrap();
    assert!(matches!(err, nilis_server::NilisError::Tls(_)), "{err}");
    assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
}
