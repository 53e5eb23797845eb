use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use mobc::{Connection, Manager, Pool};
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_open: u64,
    pub max_idle: u64,
    /// Upper bound on waiting for a pooled connection.
    pub get_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_open: 16,
            max_idle: 4,
            get_timeout: Duration::from_secs(5),
        }
    }
}

type ManagerFactory<K, T> =
    Box<dyn Fn(&K, &PoolConfig) -> Result<T, <T as Manager>::Error> + Send + Sync>;

/// Lazily built connection pools, one per peer key.
pub struct ConnManager<K, T>
where
    K: Eq + Hash,
    T: Manager,
{
    pool_map: RwLock<HashMap<K, Pool<T>>>,
    factory: ManagerFactory<K, T>,
    config: PoolConfig,
}

impl<K, T> ConnManager<K, T>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    T: Manager,
{
    pub fn new<F>(factory: F, config: PoolConfig) -> Self
    where
        F: Fn(&K, &PoolConfig) -> Result<T, T::Error> + Send + Sync + 'static,
    {
        Self {
            pool_map: RwLock::new(HashMap::new()),
            factory: Box::new(factory),
            config,
        }
    }

    pub async fn get(
        &self,
        key: &K,
    ) -> Result<Connection<T>, mobc::Error<T::Error>> {
        let pool = {
            let pool_map = self.pool_map.read().await;
            pool_map.get(key).cloned()
        };
        let pool = match pool {
            Some(pool) => pool,
            None => {
                let mut pool_map = self.pool_map.write().await;
                // another task may have raced us here
                match pool_map.get(key) {
                    Some(pool) => pool.clone(),
                    None => {
                        let manager = (self.factory)(key, &self.config)
                            .map_err(mobc::Error::Inner)?;
                        let pool = Pool::builder()
                            .max_open(self.config.max_open)
                            .max_idle(self.config.max_idle)
                            .get_timeout(Some(self.config.get_timeout))
                            .build(manager);
                        debug!("create connection pool for {:?}", key);
                        pool_map.insert(key.clone(), pool.clone());
                        pool
                    }
                }
            }
        };
        pool.get().await
    }

    pub async fn pool_count(&self) -> usize {
        self.pool_map.read().await.len()
    }
}
