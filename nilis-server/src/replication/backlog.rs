/// Keys a replica is known to be missing.
///
/// A key lands here when one of its mutations could not be queued or
/// delivered. The worker later re-reads the key from storage and ships the
/// current value with the current commit sequence, which supersedes every
/// mutation that was lost for it.
#[derive(Default)]
pub(super) struct Backlog {
    keys: scc::HashSet<String>,
}

impl Backlog {
    /// Returns `false` when the key was already parked.
    pub fn park(&self, key: String) -> bool {
        self.keys.insert(key).is_ok()
    }

    pub fn unpark(&self, key: &str) -> bool {
        self.keys.remove(key).is_some()
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(self.keys.len());
        self.keys
            .scan_async(|k| {
                keys.push(k.clone());
            })
            .await;
        keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parks_each_key_once() {
        let backlog = Backlog::default();
        assert!(backlog.park("a".into()));
        assert!(!backlog.park("a".into()));
        assert!(backlog.park("b".into()));
        assert_eq!(backlog.len(), 2);

        let mut keys = backlog.keys().await;
        keys.sort();
        assert_eq!(keys, ["a", "b"]);

        assert!(backlog.unpark("a"));
        assert!(!backlog.unpark("a"));
        assert_eq!(backlog.len(), 1);
        assert!(backlog.unpark("b"));
        assert!(backlog.is_empty());
    }
}
