use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;
use nilis_storage::StorageConfig;

use crate::dispatcher::NodeRole;
use crate::replication::ReplicationConfig;
use crate::tls::TlsSettings;
use crate::topology::{RawShard, Shard, ShardId, Topology, TopologyError};
use crate::transport::PoolConfig;

#[derive(Envconfig, Clone, Debug)]
pub struct NilisConfig {
    #[envconfig(from = "NILIS_LISTEN_PORT", default = "6226")]
    pub listen_port: u16,
    #[envconfig(from = "NILIS_BIND_ADDRESS", default = "0.0.0.0")]
    pub bind_address: String,
    #[envconfig(from = "NILIS_ADVERTISE_ADDRESS")]
    pub advertise_address: Option<String>,
    #[envconfig(from = "NILIS_DATABASE_LOCATION", default = "/opt/nilis/local.db")]
    pub database_location: String,
    #[envconfig(from = "NILIS_SYNC_WRITES", default = "true")]
    pub sync_writes: bool,
    #[envconfig(from = "NILIS_SHARDING_ENABLED", default = "false")]
    pub sharding_enabled: bool,
    #[envconfig(from = "NILIS_SHARD_ID", default = "0")]
    pub shard_id: ShardId,
    #[envconfig(from = "NILIS_REPLICA", default = "false")]
    pub replica: bool,
    /// JSON list of `{"id", "address", "replicas"}` objects.
    #[envconfig(from = "NILIS_SHARDS")]
    pub shards: Option<String>,
    #[envconfig(from = "NILIS_FORWARD_TIMEOUT_MS", default = "5000")]
    pub forward_timeout_ms: u64,
    #[envconfig(from = "NILIS_REPLICATION_TIMEOUT_MS", default = "2000")]
    pub replication_timeout_ms: u64,
    #[envconfig(from = "NILIS_REPLICATION_MAX_ATTEMPTS", default = "5")]
    pub replication_max_attempts: u32,
    #[envconfig(from = "NILIS_REPLICATION_QUEUE", default = "10000")]
    pub replication_queue: usize,
    #[envconfig(from = "NILIS_POOL_MAX_OPEN", default = "16")]
    pub pool_max_open: u64,
    #[envconfig(from = "NILIS_REFLECTION_ENABLED", default = "false")]
    pub reflection_enabled: bool,
    /// Serve and dial peers over TLS.
    #[envconfig(from = "NILIS_USE_TLS", default = "false")]
    pub use_tls: bool,
    #[envconfig(from = "NILIS_TLS_CERT")]
    pub tls_cert: Option<String>,
    #[envconfig(from = "NILIS_TLS_KEY")]
    pub tls_key: Option<String>,
    /// CA bundle for peer verification; also turns on client certificates.
    #[envconfig(from = "NILIS_TLS_CA")]
    pub tls_ca: Option<String>,
    #[envconfig(from = "NILIS_TLS_DOMAIN")]
    pub tls_domain: Option<String>,
}

impl Default for NilisConfig {
    fn default() -> Self {
        Self {
            listen_port: 6226,
            bind_address: "0.0.0.0".into(),
            advertise_address: None,
            database_location: "/opt/nilis/local.db".into(),
            sync_writes: true,
            sharding_enabled: false,
            shard_id: 0,
            replica: false,
            shards: None,
            forward_timeout_ms: 5000,
            replication_timeout_ms: 2000,
            replication_max_attempts: 5,
            replication_queue: 10000,
            pool_max_open: 16,
            reflection_enabled: false,
            use_tls: false,
            tls_cert: None,
            tls_key: None,
            tls_ca: None,
            tls_domain: None,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("listen port must be between 1 and 65535")]
    InvalidListenPort,
    #[error("bind address must not be empty")]
    EmptyBindAddress,
    #[error("bind address '{0}' is not an ip address")]
    InvalidBindAddress(String),
    #[error("database location must not be empty")]
    EmptyDatabaseLocation,
    #[error("{0} must be greater than zero")]
    InvalidSetting(&'static str),
    #[error("sharding is enabled but NILIS_SHARDS is not set")]
    MissingShards,
    #[error("malformed shard list: {0}")]
    MalformedShards(#[from] serde_json::Error),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error("local shard {0} is not part of the topology")]
    UnknownLocalShard(ShardId),
    #[error("replica mode requires sharding to be enabled")]
    ReplicaWithoutSharding,
    #[error("tls certificate location cannot be empty when using tls mode")]
    MissingTlsCert,
    #[error("tls key location cannot be empty when using tls mode")]
    MissingTlsKey,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// The validated cluster view a node runs with.
#[derive(Debug, Clone)]
pub struct ClusterSettings {
    pub topology: Arc<Topology>,
    pub local_shard: Shard,
    pub role: NodeRole,
}

impl NilisConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .bind_address
            .parse()
            .map_err(|_| ConfigError::InvalidBindAddress(self.bind_address.clone()))?;
        Ok(SocketAddr::new(ip, self.listen_port))
    }

    /// Address peers and the single-shard topology use for this node.
    pub fn advertise_addr(&self) -> String {
        match &self.advertise_address {
            Some(addr) if !addr.is_empty() => addr.clone(),
            _ => format!("127.0.0.1:{}", self.listen_port),
        }
    }

    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig::new(&self.database_location)
            .with_sync_writes(self.sync_writes)
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_open: self.pool_max_open,
            ..Default::default()
        }
    }

    pub fn replication_config(&self) -> ReplicationConfig {
        ReplicationConfig {
            timeout: Duration::from_millis(self.replication_timeout_ms),
            max_attempts: self.replication_max_attempts,
            queue_capacity: self.replication_queue,
            ..Default::default()
        }
    }

    /// `None` unless TLS is on.
    pub fn tls_settings(&self) -> Result<Option<TlsSettings>, ConfigError> {
        if !self.use_tls {
            return Ok(None);
        }
        let cert = non_empty(&self.tls_cert).ok_or(ConfigError::MissingTlsCert)?;
        let key = non_empty(&self.tls_key).ok_or(ConfigError::MissingTlsKey)?;
        Ok(Some(TlsSettings {
            cert: PathBuf::from(cert),
            key: PathBuf::from(key),
            ca: non_empty(&self.tls_ca).map(PathBuf::from),
            domain: non_empty(&self.tls_domain).map(str::to_owned),
        }))
    }

    /// Check every setting and build the cluster view. Nothing is opened or
    /// bound here.
    pub fn validate(&self) -> Result<ClusterSettings, ConfigError> {
        if self.listen_port == 0 {
            return Err(ConfigError::InvalidListenPort);
        }
        if self.bind_address.trim().is_empty() {
            return Err(ConfigError::EmptyBindAddress);
        }
        self.listen_addr()?;
        if self.database_location.trim().is_empty() {
            return Err(ConfigError::EmptyDatabaseLocation);
        }
        let positive = [
            ("NILIS_FORWARD_TIMEOUT_MS", self.forward_timeout_ms == 0),
            ("NILIS_REPLICATION_TIMEOUT_MS", self.replication_timeout_ms == 0),
            (
                "NILIS_REPLICATION_MAX_ATTEMPTS",
                self.replication_max_attempts == 0,
            ),
            ("NILIS_REPLICATION_QUEUE", self.replication_queue == 0),
            ("NILIS_POOL_MAX_OPEN", self.pool_max_open == 0),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, zero)| *zero) {
            return Err(ConfigError::InvalidSetting(*name));
        }
        self.tls_settings()?;

        if !self.sharding_enabled {
            if self.replica {
                return Err(ConfigError::ReplicaWithoutSharding);
            }
            let topology = Topology::single(self.advertise_addr());
            let local_shard = topology
                .get(0)
                .cloned()
                .ok_or(ConfigError::UnknownLocalShard(0))?;
            return Ok(ClusterSettings {
                topology: Arc::new(topology),
                local_shard,
                role: NodeRole::Primary,
            });
        }

        let raw = match &self.shards {
            Some(raw) if !raw.trim().is_empty() => raw,
            _ => return Err(ConfigError::MissingShards),
        };
        let raw: Vec<RawShard> = serde_json::from_str(raw)?;
        let topology = Topology::from_raw(&raw)?;
        let local_shard = topology
            .get(self.shard_id)
            .cloned()
            .ok_or(ConfigError::UnknownLocalShard(self.shard_id))?;
        let role = if self.replica {
            NodeRole::Replica
        } else {
            NodeRole::Primary
        };
        Ok(ClusterSettings {
            topology: Arc::new(topology),
            local_shard,
            role,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> NilisConfig {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        NilisConfig::init_from_hashmap(&map).unwrap()
    }

    const TWO_SHARDS: &str = r#"[
        {"id": 1, "address": "10.0.0.2:6226", "replicas": ["10.0.0.12:6226"]},
        {"id": 0, "address": "10.0.0.1:6226"}
    ]"#;

    #[test]
    fn defaults_match_env_defaults() {
        let from_env = config(&[]);
        let default = NilisConfig::default();
        assert_eq!(from_env.listen_port, default.listen_port);
        assert_eq!(from_env.bind_address, default.bind_address);
        assert_eq!(from_env.database_location, default.database_location);
        assert_eq!(from_env.sync_writes, default.sync_writes);
        assert_eq!(from_env.forward_timeout_ms, default.forward_timeout_ms);
        assert_eq!(from_env.replication_queue, default.replication_queue);
        assert_eq!(from_env.pool_max_open, default.pool_max_open);
        assert!(!from_env.sharding_enabled);
        assert!(from_env.shards.is_none());
    }

    #[test]
    fn unsharded_node_owns_a_single_shard() {
        let settings = config(&[("NILIS_LISTEN_PORT", "7000")]).validate().unwrap();
        assert_eq!(settings.topology.shard_count(), 1);
        assert_eq!(settings.local_shard.id, 0);
        assert_eq!(settings.local_shard.address, "127.0.0.1:7000");
        assert_eq!(settings.role, NodeRole::Primary);
    }

    #[test]
    fn sharded_node_finds_its_shard() {
        let settings = config(&[
            ("NILIS_SHARDING_ENABLED", "true"),
            ("NILIS_SHARD_ID", "1"),
            ("NILIS_SHARDS", TWO_SHARDS),
        ])
        .validate()
        .unwrap();
        assert_eq!(settings.topology.shard_count(), 2);
        assert_eq!(settings.local_shard.address, "10.0.0.2:6226");
        assert_eq!(settings.local_shard.replicas.len(), 1);
    }

    #[test]
    fn replica_role() {
        let settings = config(&[
            ("NILIS_SHARDING_ENABLED", "true"),
            ("NILIS_SHARD_ID", "1"),
            ("NILIS_REPLICA", "true"),
            ("NILIS_SHARDS", TWO_SHARDS),
        ])
        .validate()
        .unwrap();
        assert_eq!(settings.role, NodeRole::Replica);

        let err = config(&[("NILIS_REPLICA", "true")]).validate().unwrap_err();
        assert!(matches!(err, ConfigError::ReplicaWithoutSharding));
    }

    #[test]
    fn rejects_bad_settings() {
        let err = config(&[("NILIS_LISTEN_PORT", "0")]).validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidListenPort));

        let err = config(&[("NILIS_BIND_ADDRESS", "")]).validate().unwrap_err();
        assert!(matches!(err, ConfigError::EmptyBindAddress));

        let err = config(&[("NILIS_BIND_ADDRESS", "localhost")])
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBindAddress(_)));

        let err = config(&[("NILIS_DATABASE_LOCATION", " ")])
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::EmptyDatabaseLocation));

        let err = config(&[("NILIS_REPLICATION_QUEUE", "0")])
            .validate()
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidSetting("NILIS_REPLICATION_QUEUE")
        ));
    }

    #[test]
    fn out_of_range_port_fails_to_load() {
        let map = HashMap::from([(
            "NILIS_LISTEN_PORT".to_string(),
            "70000".to_string(),
        )]);
        assert!(NilisConfig::init_from_hashmap(&map).is_err());
    }

    #[test]
    fn rejects_bad_shard_lists() {
        let err = config(&[("NILIS_SHARDING_ENABLED", "true")])
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingShards));

        let err = config(&[
            ("NILIS_SHARDING_ENABLED", "true"),
            ("NILIS_SHARDS", "[{\"id\": 0"),
        ])
        .validate()
        .unwrap_err();
        assert!(matches!(err, ConfigError::MalformedShards(_)));

        let err = config(&[
            ("NILIS_SHARDING_ENABLED", "true"),
            (
                "NILIS_SHARDS",
                r#"[{"id": 0, "address": "10.0.0.1:6226"},
                    {"id": 1, "address": "10.0.0.2:6226"},
                    {"id": 2, "address": "10.0.0.3:6226"}]"#,
            ),
        ])
        .validate()
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Topology(TopologyError::NotPowerOfTwo(3))
        ));

        let err = config(&[
            ("NILIS_SHARDING_ENABLED", "true"),
            ("NILIS_SHARD_ID", "5"),
            ("NILIS_SHARDS", TWO_SHARDS),
        ])
        .validate()
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownLocalShard(5)));
    }

    #[test]
    fn tls_needs_cert_and_key() {
        assert!(config(&[]).tls_settings().unwrap().is_none());
        // paths are ignored while tls is off
        let off = config(&[("NILIS_TLS_CERT", "/etc/nilis/node.pem")]);
        assert!(off.validate().is_ok());
        assert!(off.tls_settings().unwrap().is_none());

        let err = config(&[("NILIS_USE_TLS", "true")]).validate().unwrap_err();
        assert!(matches!(err, ConfigError::MissingTlsCert));

        let err = config(&[
            ("NILIS_USE_TLS", "true"),
            ("NILIS_TLS_CERT", "/etc/nilis/node.pem"),
            ("NILIS_TLS_KEY", "  "),
        ])
        .validate()
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingTlsKey));
        assert_eq!(
            err.to_string(),
            "tls key location cannot be empty when using tls mode"
        );
    }

    #[test]
    fn tls_settings_from_env() {
        let cfg = config(&[
            ("NILIS_USE_TLS", "true"),
            ("NILIS_TLS_CERT", "/etc/nilis/node.pem"),
            ("NILIS_TLS_KEY", "/etc/nilis/node.key"),
            ("NILIS_TLS_CA", "/etc/nilis/ca.pem"),
        ]);
        cfg.validate().unwrap();
        let tls = cfg.tls_settings().unwrap().unwrap();
        assert_eq!(tls.cert, PathBuf::from("/etc/nilis/node.pem"));
        assert_eq!(tls.key, PathBuf::from("/etc/nilis/node.key"));
        assert_eq!(tls.ca, Some(PathBuf::from("/etc/nilis/ca.pem")));
        assert_eq!(tls.domain, None);
    }

    #[test]
    fn derived_settings() {
        let cfg = config(&[
            ("NILIS_DATABASE_LOCATION", "/tmp/x.db"),
            ("NILIS_SYNC_WRITES", "false"),
            ("NILIS_REPLICATION_MAX_ATTEMPTS", "7"),
            ("NILIS_ADVERTISE_ADDRESS", "10.1.1.1:9000"),
        ]);
        assert_eq!(cfg.storage_config().path, "/tmp/x.db");
        assert!(!cfg.storage_config().sync_writes);
        assert_eq!(cfg.replication_config().max_attempts, 7);
        assert_eq!(cfg.advertise_addr(), "10.1.1.1:9000");
        assert_eq!(cfg.forward_timeout(), Duration::from_millis(5000));
        assert_eq!(cfg.listen_addr().unwrap().port(), 6226);
    }
}
