//! This module provides a wrapper around a real RemoteStorage implementation that
//! causes the first N attempts at each upload or download operation to fail. For
//! testing purposes.
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;

use crate::{DownloadError, GenericRemoteStorage, RemotePath, RemoteStorage};

pub struct UnreliableWrapper {
    inner: GenericRemoteStorage,

    // This many attempts of each operation will fail, then we let it succeed.
    attempts_to_fail: u64,

    // Tracks how many failed attempts of each operation has been made.
    attempts: Mutex<HashMap<RemoteOp, u64>>,

    // Every call per operation, failed or not.
    calls: Mutex<HashMap<RemoteOp, u64>>,

    // While set, every operation fails.
    outage: AtomicBool,

    // Added to every `get`, to widen windows where downloads are in flight.
    get_delay: Mutex<Option<Duration>>,
}

/// Used to identify retries of different unique operation.
#[derive(Debug, Hash, Eq, PartialEq, Clone)]
pub enum RemoteOp {
    List(Option<RemotePath>),
    Put(RemotePath),
    Get(RemotePath),
    Delete(RemotePath),
}

impl UnreliableWrapper {
    pub fn new(inner: GenericRemoteStorage, attempts_to_fail: u64) -> Self {
        assert!(
            !matches!(inner, GenericRemoteStorage::Unreliable(_)),
            "wrapping an unreliable storage twice"
        );
        UnreliableWrapper {
            inner,
            attempts_to_fail,
            attempts: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            outage: AtomicBool::new(false),
            get_delay: Mutex::new(None),
        }
    }

    /// Makes every following operation fail until switched back.
    pub fn set_outage(&self, outage: bool) {
        self.outage.store(outage, Ordering::Relaxed);
    }

    pub fn set_get_delay(&self, delay: Option<Duration>) {
        *self.get_delay.lock().unwrap() = delay;
    }

    /// How many times the operation was called, including failed attempts.
    pub fn calls(&self, op: &RemoteOp) -> u64 {
        self.calls.lock().unwrap().get(op).copied().unwrap_or(0)
    }

    /// Total `get` calls made against any path.
    pub fn total_gets(&self) -> u64 {
        self.total_calls(|op| matches!(op, RemoteOp::Get(_)))
    }

    /// Total `put` calls made against any path.
    pub fn total_puts(&self) -> u64 {
        self.total_calls(|op| matches!(op, RemoteOp::Put(_)))
    }

    fn total_calls(&self, filter: impl Fn(&RemoteOp) -> bool) -> u64 {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(op, _)| filter(op))
            .map(|(_, count)| *count)
            .sum()
    }

    ///
    /// Common functionality for all operations.
    ///
    /// On the first attempts of this operation, return an error. After 'attempts_to_fail'
    /// failures, let the operation go ahead, and clear the counter.
    ///
    fn attempt(&self, op: RemoteOp) -> anyhow::Result<()> {
        *self.calls.lock().unwrap().entry(op.clone()).or_insert(0) += 1;

        if self.outage.load(Ordering::Relaxed) {
            anyhow::bail!("simulated outage for {op:?}");
        }

        let mut attempts = self.attempts.lock().unwrap();
        match attempts.entry(op) {
            Entry::Occupied(e) if *e.get() >= self.attempts_to_fail => {
                e.remove();
                Ok(())
            }
            Entry::Occupied(mut e) => {
                *e.get_mut() += 1;
                anyhow::bail!("simulated failure of remote operation {:?}", e.key())
            }
            Entry::Vacant(_) if self.attempts_to_fail == 0 => Ok(()),
            Entry::Vacant(e) => {
                let error = anyhow::anyhow!("simulated failure of remote operation {:?}", e.key());
                e.insert(1);
                Err(error)
            }
        }
    }
}

#[async_trait::async_trait]
impl RemoteStorage for UnreliableWrapper {
    async fn list(&self, prefix: Option<&RemotePath>) -> Result<Vec<RemotePath>, DownloadError> {
        self.attempt(RemoteOp::List(prefix.cloned()))
            .map_err(DownloadError::Other)?;
        self.inner.list(prefix).await
    }

    async fn put(&self, data: Bytes, to: &RemotePath) -> anyhow::Result<()> {
        self.attempt(RemoteOp::Put(to.clone()))?;
        self.inner.put(data, to).await
    }

    async fn get(&self, from: &RemotePath) -> Result<Bytes, DownloadError> {
        self.attempt(RemoteOp::Get(from.clone()))
            .map_err(DownloadError::Other)?;
        let delay = *self.get_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.get(from).await
    }

    async fn delete(&self, path: &RemotePath) -> anyhow::Result<()> {
        self.attempt(RemoteOp::Delete(path.clone()))?;
        self.inner.delete(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LocalFs;

    fn wrapped(attempts_to_fail: u64) -> (UnreliableWrapper, camino_tempfile::Utf8TempDir) {
        let root = camino_tempfile::tempdir().unwrap();
        let local = LocalFs::new(root.path().to_owned(), Duration::from_secs(10)).unwrap();
        (
            UnreliableWrapper::new(GenericRemoteStorage::LocalFs(local), attempts_to_fail),
            root,
        )
    }

    #[tokio::test]
    async fn fails_configured_number_of_times() {
        let (storage, _root) = wrapped(2);
        let path = RemotePath::from_string("a/b").unwrap();

        storage.put(Bytes::from_static(b"x"), &path).await.unwrap_err();
        storage.put(Bytes::from_static(b"x"), &path).await.unwrap_err();
        storage.put(Bytes::from_static(b"x"), &path).await.unwrap();

        assert_eq!(storage.calls(&RemoteOp::Put(path.clone())), 3);
    }

    #[tokio::test]
    async fn outage_fails_everything_and_counts_gets() {
        let (storage, _root) = wrapped(0);
        let path = RemotePath::from_string("a/b").unwrap();
        storage.put(Bytes::from_static(b"x"), &path).await.unwrap();

        storage.set_outage(true);
        let err = storage.get(&path).await.unwrap_err();
        assert!(matches!(err, DownloadError::Other(_)), "{err:?}");

        storage.set_outage(false);
        assert_eq!(&storage.get(&path).await.unwrap()[..], b"x");
        assert_eq!(storage.total_gets(), 2);
    }
}
