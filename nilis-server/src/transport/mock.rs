use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tonic::Status;

use super::{ClusterTransport, TransportError};

/// In-memory stand-in for remote nodes, keyed by address.
#[derive(Default)]
pub(crate) struct MockTransport {
    pub nodes: Mutex<HashMap<String, HashMap<String, Bytes>>>,
    pub down: Mutex<HashSet<String>>,
    /// Status every Store call answers with, when set.
    pub reply_status: Mutex<Option<Status>>,
    pub applied: Mutex<Vec<(String, nilis_pb::Mutation)>>,
    /// Number of upcoming `apply` calls that fail as unavailable.
    pub fail_applies: AtomicU32,
    pub apply_delay: Mutex<Option<Duration>>,
}

impl MockTransport {
    pub fn value(&self, address: &str, key: &str) -> Option<Bytes> {
        self.nodes
            .lock()
            .unwrap()
            .get(address)
            .and_then(|node| node.get(key).cloned())
    }

    pub fn set_down(&self, address: &str) {
        self.down.lock().unwrap().insert(address.to_string());
    }

    pub fn applied_to(&self, address: &str) -> Vec<nilis_pb::Mutation> {
        self.applied
            .lock()
            .unwrap()
            .iter()
            .filter(|(a, _)| a == address)
            .map(|(_, m)| m.clone())
            .collect()
    }

    fn check(&self, address: &str) -> Result<(), TransportError> {
        if self.down.lock().unwrap().contains(address) {
            return Err(Status::unavailable("connection refused").into());
        }
        if let Some(status) = self.reply_status.lock().unwrap().clone() {
            return Err(status.into());
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ClusterTransport for MockTransport {
    async fn get(
        &self,
        address: &str,
        key: &str,
        _timeout: Duration,
    ) -> Result<Option<Bytes>, TransportError> {
        self.check(address)?;
        Ok(self.value(address, key))
    }

    async fn set(
        &self,
        address: &str,
        key: &str,
        value: Bytes,
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        self.check(address)?;
        self.nodes
            .lock()
            .unwrap()
            .entry(address.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(
        &self,
        address: &str,
        key: &str,
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        self.check(address)?;
        if let Some(node) = self.nodes.lock().unwrap().get_mut(address) {
            node.remove(key);
        }
        Ok(())
    }

    async fn apply(
        &self,
        address: &str,
        mutation: nilis_pb::Mutation,
        timeout: Duration,
    ) -> Result<bool, TransportError> {
        let delay = *self.apply_delay.lock().unwrap();
        if let Some(delay) = delay {
            if delay >= timeout {
                tokio::time::sleep(timeout).await;
                return Err(TransportError::Timeout);
            }
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .fail_applies
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                n.checked_sub(1)
            })
            .is_ok();
        if failing || self.down.lock().unwrap().contains(address) {
            return Err(Status::unavailable("replica down").into());
        }
        self.applied
            .lock()
            .unwrap()
            .push((address.to_string(), mutation));
        Ok(true)
    }
}
