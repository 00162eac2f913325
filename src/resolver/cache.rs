//! Run-scoped metadata cache.
//!
//! Candidate lists are fetched at most once per `(source, name)` per run.
//! Concurrent requesters of the same key share one `OnceCell`, so the
//! second caller awaits the first fetch instead of issuing its own.
//! Failures are cached too and handed to every requester.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use log::debug;
use tokio::sync::OnceCell;

use crate::endpoint::PackageMetadata;
use crate::error::EndpointError;

pub type Candidates = Arc<Vec<PackageMetadata>>;
type Entry = Arc<OnceCell<Result<Candidates, EndpointError>>>;

#[derive(Default)]
pub struct MetadataCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Entry {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    /// Cached candidates for `key`, running `fetch` if nobody has yet.
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, fetch: F) -> Result<Candidates, EndpointError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<PackageMetadata>, EndpointError>>,
    {
        let cell = self.entry(key);
        cell.get_or_init(|| async move {
            debug!("Fetching metadata for {}", key);
            fetch().await.map(Arc::new)
        })
        .await
        .clone()
    }

    /// Whether `key` has been fetched (successfully or not).
    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .lock()
            .map(|entries| entries.get(key).is_some_and(|cell| cell.initialized()))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::test_util::meta;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_fetches_once_per_key() {
        let cache = MetadataCache::new();
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            let candidates = cache
                .get_or_fetch("registry:foo", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(vec![meta("foo", "1.0.0")])
                })
                .await
                .unwrap();
            assert_eq!(candidates.len(), 1);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.contains("registry:foo"));
        assert!(!cache.contains("registry:bar"));
    }

    #[tokio::test]
    async fn test_concurrent_requesters_share_one_fetch() {
        let cache = Arc::new(MetadataCache::new());
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch("registry:foo", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Ok(vec![meta("foo", "1.0.0")])
                    })
                    .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failures_are_shared() {
        let cache = MetadataCache::new();
        let first = cache
            .get_or_fetch("registry:gone", || async {
                Err(EndpointError::NotFound("gone".into()))
            })
            .await;
        let second = cache
            .get_or_fetch("registry:gone", || async {
                Ok(vec![meta("gone", "1.0.0")])
            })
            .await;
        assert_eq!(first.unwrap_err(), second.unwrap_err());
    }
}
