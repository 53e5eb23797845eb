use std::path::Path;

use redb::{
    Database, DatabaseError, Durability, ReadableDatabase, ReadableTable,
    TableDefinition, WriteTransaction,
};
use tracing::{debug, info};

use crate::error::map_redb_err;
use crate::{StorageConfig, StorageError, StorageResult};

/// The single logical namespace ("bucket") of a node.
const DATA: TableDefinition<'static, &'static [u8], &'static [u8]> =
    TableDefinition::new("nilis");
const META: TableDefinition<'static, &'static str, u64> =
    TableDefinition::new("nilis_meta");
/// Last replicated sequence applied per key, tombstones included.
const VERSIONS: TableDefinition<'static, &'static [u8], u64> =
    TableDefinition::new("nilis_versions");

const COMMIT_SEQ_KEY: &str = "commit_seq";

/// Monotonic per-node counter assigned to every committed write.
pub type CommitSeq = u64;

/// A single-key write, as applied on a primary or shipped to a replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Set { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl Mutation {
    pub fn key(&self) -> &[u8] {
        match self {
            Mutation::Set { key, .. } => key,
            Mutation::Delete { key } => key,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The key already carries a version at or above the incoming sequence.
    Stale,
}

/// Redb-backed storage engine
pub struct StorageEngine {
    db: Database,
    config: StorageConfig,
}

impl StorageEngine {
    /// Open or create the database file and its tables.
    ///
    /// The file stays exclusively locked until the engine is closed or dropped,
    /// so a second open of the same path fails with [`StorageError::AlreadyOpen`].
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        if config.path.is_empty() {
            return Err(StorageError::configuration("Path is required"));
        }
        let path = Path::new(&config.path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(StorageError::Io)?;
            }
        }

        let db = Database::builder().create(path).map_err(|e| match e {
            DatabaseError::DatabaseAlreadyOpen => {
                StorageError::AlreadyOpen(config.path.clone())
            }
            other => map_redb_err(other),
        })?;

        // Create every table up front so the first read never misses one
        {
            let wtxn = db.begin_write().map_err(map_redb_err)?;
            wtxn.open_table(DATA).map_err(map_redb_err)?;
            wtxn.open_table(META).map_err(map_redb_err)?;
            wtxn.open_table(VERSIONS).map_err(map_redb_err)?;
            wtxn.commit().map_err(map_redb_err)?;
        }

        info!(path = %config.path, sync_writes = config.sync_writes, "opened storage engine");
        Ok(Self { db, config })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Read the last committed value of `key` from a snapshot.
    pub fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        let rtxn = self.db.begin_read().map_err(map_redb_err)?;
        let table = rtxn.open_table(DATA).map_err(map_redb_err)?;
        let value = table
            .get(key)
            .map_err(map_redb_err)?
            .map(|v| v.value().to_vec());
        Ok(value)
    }

    /// Value of `key` together with the node's commit sequence, read from
    /// one snapshot. Any later write to `key` commits with a higher sequence.
    pub fn get_with_seq(
        &self,
        key: &[u8],
    ) -> StorageResult<(Option<Vec<u8>>, CommitSeq)> {
        let rtxn = self.db.begin_read().map_err(map_redb_err)?;
        let table = rtxn.open_table(DATA).map_err(map_redb_err)?;
        let meta = rtxn.open_table(META).map_err(map_redb_err)?;
        let value = table
            .get(key)
            .map_err(map_redb_err)?
            .map(|v| v.value().to_vec());
        let seq = meta
            .get(COMMIT_SEQ_KEY)
            .map_err(map_redb_err)?
            .map(|v| v.value())
            .unwrap_or(0);
        Ok((value, seq))
    }

    pub fn set(&self, key: &[u8], value: &[u8]) -> StorageResult<CommitSeq> {
        self.write_txn(|wtxn| {
            {
                let mut table = wtxn.open_table(DATA).map_err(map_redb_err)?;
                table.insert(key, value).map_err(map_redb_err)?;
            }
            bump_commit_seq(wtxn)
        })
    }

    /// Remove `key`. Removing an absent key still commits and succeeds.
    pub fn delete(&self, key: &[u8]) -> StorageResult<CommitSeq> {
        self.write_txn(|wtxn| {
            {
                let mut table = wtxn.open_table(DATA).map_err(map_redb_err)?;
                table.remove(key).map_err(map_redb_err)?;
            }
            bump_commit_seq(wtxn)
        })
    }

    pub fn write(&self, mutation: &Mutation) -> StorageResult<CommitSeq> {
        match mutation {
            Mutation::Set { key, value } => self.set(key, value),
            Mutation::Delete { key } => self.delete(key),
        }
    }

    /// Apply a mutation shipped by the primary, unless the key already holds
    /// a version at or above `seq`.
    pub fn apply_replicated(
        &self,
        seq: CommitSeq,
        mutation: &Mutation,
    ) -> StorageResult<ApplyOutcome> {
        self.write_txn(|wtxn| {
            let mut versions =
                wtxn.open_table(VERSIONS).map_err(map_redb_err)?;
            let current = versions
                .get(mutation.key())
                .map_err(map_redb_err)?
                .map(|v| v.value());
            if current.is_some_and(|v| v >= seq) {
                debug!(seq, ?current, "skip stale replicated mutation");
                return Ok(ApplyOutcome::Stale);
            }
            {
                let mut table = wtxn.open_table(DATA).map_err(map_redb_err)?;
                match mutation {
                    Mutation::Set { key, value } => {
                        table
                            .insert(key.as_slice(), value.as_slice())
                            .map_err(map_redb_err)?;
                    }
                    Mutation::Delete { key } => {
                        table.remove(key.as_slice()).map_err(map_redb_err)?;
                    }
                }
            }
            versions
                .insert(mutation.key(), seq)
                .map_err(map_redb_err)?;
            Ok(ApplyOutcome::Applied)
        })
    }

    pub fn last_commit_seq(&self) -> StorageResult<CommitSeq> {
        let rtxn = self.db.begin_read().map_err(map_redb_err)?;
        let meta = rtxn.open_table(META).map_err(map_redb_err)?;
        let seq = meta
            .get(COMMIT_SEQ_KEY)
            .map_err(map_redb_err)?
            .map(|v| v.value())
            .unwrap_or(0);
        Ok(seq)
    }

    /// Last replicated sequence recorded for `key`.
    pub fn version(&self, key: &[u8]) -> StorageResult<Option<CommitSeq>> {
        let rtxn = self.db.begin_read().map_err(map_redb_err)?;
        let versions = rtxn.open_table(VERSIONS).map_err(map_redb_err)?;
        let version = versions
            .get(key)
            .map_err(map_redb_err)?
            .map(|v| v.value());
        Ok(version)
    }

    /// Release the database file and its lock.
    pub fn close(self) -> StorageResult<()> {
        let path = self.config.path;
        drop(self.db);
        info!(path = %path, "closed storage engine");
        Ok(())
    }

    fn write_txn<T>(
        &self,
        f: impl FnOnce(&WriteTransaction) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut wtxn = self.db.begin_write().map_err(map_redb_err)?;
        if !self.config.sync_writes {
            let _ = wtxn.set_durability(Durability::None);
        }
        // an error drops the transaction, which aborts it
        let out = f(&wtxn)?;
        wtxn.commit().map_err(map_redb_err)?;
        Ok(out)
    }
}

fn bump_commit_seq(wtxn: &WriteTransaction) -> StorageResult<CommitSeq> {
    let mut meta = wtxn.open_table(META).map_err(map_redb_err)?;
    let current = meta
        .get(COMMIT_SEQ_KEY)
        .map_err(map_redb_err)?
        .map(|v| v.value())
        .unwrap_or(0);
    let next = current + 1;
    meta.insert(COMMIT_SEQ_KEY, next).map_err(map_redb_err)?;
    Ok(next)
}
