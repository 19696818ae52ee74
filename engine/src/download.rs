//! The CAS port and the bounded-concurrency fetcher built on it (spec §4.4).
//! A real CAS wire client is out of scope (spec §1); this module is the
//! trait callers program against plus an in-memory fake for tests.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::error::Result;

/// The outcome of one CAS read (spec §4.4 / §6). `NotFound` is retryable (a
/// transaction becomes unresolvable); `TooLarge` is fatal for that
/// transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasReadOutcome {
    Found(Vec<u8>),
    NotFound,
    TooLarge,
}

/// The content-addressable store port (spec §6). `read`/`write` identifiers
/// are multihash-encoded strings.
#[async_trait]
pub trait Cas: Send + Sync {
    async fn read(&self, hash: &str, max_bytes: usize) -> Result<CasReadOutcome>;
    async fn write(&self, content: &[u8]) -> Result<String>;
}

/// Bounds in-flight CAS fetches to `max_concurrent_downloads` (spec §4.4,
/// §5's back-pressure mechanism). Suspension happens in `download`'s
/// `acquire().await`, the sole capacity gate; the observer layers its own
/// in-flight-transaction cap on top of this.
pub struct DownloadManager<C: Cas> {
    cas: Arc<C>,
    semaphore: Arc<Semaphore>,
}

impl<C: Cas> DownloadManager<C> {
    #[must_use]
    pub fn new(cas: Arc<C>, max_concurrent_downloads: usize) -> Self {
        Self {
            cas,
            semaphore: Arc::new(Semaphore::new(max_concurrent_downloads.max(1))),
        }
    }

    /// Awaits a free slot, then fetches `hash` capped at `max_bytes`.
    pub async fn download(&self, hash: &str, max_bytes: usize) -> Result<CasReadOutcome> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("the download manager's semaphore is never closed");
        self.cas.read(hash, max_bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex;

    struct FakeCas {
        content: Mutex<std::collections::HashMap<String, Vec<u8>>>,
        in_flight: AtomicUsize,
        max_observed_in_flight: AtomicUsize,
    }

    impl FakeCas {
        fn new() -> Self {
            Self {
                content: Mutex::new(std::collections::HashMap::new()),
                in_flight: AtomicUsize::new(0),
                max_observed_in_flight: AtomicUsize::new(0),
            }
        }

        async fn put(&self, hash: &str, bytes: Vec<u8>) {
            self.content.lock().await.insert(hash.to_string(), bytes);
        }
    }

    #[async_trait]
    impl Cas for FakeCas {
        async fn read(&self, hash: &str, max_bytes: usize) -> Result<CasReadOutcome> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_observed_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let store = self.content.lock().await;
            match store.get(hash) {
                None => Ok(CasReadOutcome::NotFound),
                Some(bytes) if bytes.len() > max_bytes => Ok(CasReadOutcome::TooLarge),
                Some(bytes) => Ok(CasReadOutcome::Found(bytes.clone())),
            }
        }

        async fn write(&self, content: &[u8]) -> Result<String> {
            let hash = format!("hash-{}", content.len());
            self.content.lock().await.insert(hash.clone(), content.to_vec());
            Ok(hash)
        }
    }

    #[tokio::test]
    async fn download_returns_found_for_known_content_within_the_size_cap() {
        let cas = Arc::new(FakeCas::new());
        cas.put("h1", b"hello".to_vec()).await;
        let manager = DownloadManager::new(cas, 4);

        assert_eq!(
            manager.download("h1", 100).await.unwrap(),
            CasReadOutcome::Found(b"hello".to_vec())
        );
    }

    #[tokio::test]
    async fn download_reports_too_large_when_the_cap_is_exceeded() {
        let cas = Arc::new(FakeCas::new());
        cas.put("h1", vec![0u8; 100]).await;
        let manager = DownloadManager::new(cas, 4);

        assert_eq!(manager.download("h1", 10).await.unwrap(), CasReadOutcome::TooLarge);
    }

    #[tokio::test]
    async fn download_reports_not_found_for_unknown_hashes() {
        let cas = Arc::new(FakeCas::new());
        let manager = DownloadManager::new(cas, 4);
        assert_eq!(manager.download("missing", 100).await.unwrap(), CasReadOutcome::NotFound);
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_the_configured_cap() {
        let cas = Arc::new(FakeCas::new());
        for i in 0..8 {
            cas.put(&format!("h{i}"), b"x".to_vec()).await;
        }
        let manager = Arc::new(DownloadManager::new(cas.clone(), 3));

        let mut handles = Vec::new();
        for i in 0..8 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager.download(&format!("h{i}"), 100).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(cas.max_observed_in_flight.load(Ordering::SeqCst) <= 3);
    }
}
