use async_trait::async_trait;
use std::{collections::HashMap, time::Duration};
use tokio::{sync::Mutex, time::Instant};

use super::{Decision, GreylistStore, StoreError};
use crate::fingerprint::Fingerprint;

enum Entry {
    Pending { first_seen: Instant },
    Cleared,
}

/// Process-local greylist.
///
/// Entries never expire: once a pair is cleared it stays cleared until the
/// process exits. Not shareable between processes; several filter instances
/// each running one of these would greylist independently.
pub struct MemoryStore {
    entries: Mutex<HashMap<Fingerprint, Entry>>,
    retry_delay: Duration,
}

impl MemoryStore {
    /// `retry_delay` is how long a pending pair must wait before a retry
    /// clears it. Zero clears it on the first retry.
    pub fn new(retry_delay: Duration) -> Self {
        MemoryStore {
            entries: Mutex::new(HashMap::new()),
            retry_delay,
        }
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[async_trait]
impl GreylistStore for MemoryStore {
    async fn decide(&self, fingerprint: &Fingerprint) -> Result<Decision, StoreError> {
        let mut entries = self.entries.lock().await;

        let decision = match entries.get_mut(fingerprint) {
            None => {
                entries.insert(
                    fingerprint.clone(),
                    Entry::Pending {
                        first_seen: Instant::now(),
                    },
                );
                Decision::New
            }
            Some(entry) => match *entry {
                Entry::Cleared => Decision::Allow,
                Entry::Pending { first_seen } if first_seen.elapsed() < self.retry_delay => {
                    Decision::Pending
                }
                Entry::Pending { .. } => {
                    *entry = Entry::Cleared;
                    Decision::Allow
                }
            },
        };

        Ok(decision)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fingerprint() -> Fingerprint {
        Fingerprint::new("alice@example.com", "bob@example.com")
    }

    #[tokio::test]
    async fn test_first_sighting_is_new() {
        let store = MemoryStore::new(Duration::ZERO);
        assert_eq!(store.decide(&fingerprint()).await.unwrap(), Decision::New);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_second_sighting_allows() {
        let store = MemoryStore::new(Duration::ZERO);
        store.decide(&fingerprint()).await.unwrap();
        assert_eq!(store.decide(&fingerprint()).await.unwrap(), Decision::Allow);
    }

    #[tokio::test]
    async fn test_allow_is_permanent() {
        let store = MemoryStore::new(Duration::ZERO);
        store.decide(&fingerprint()).await.unwrap();
        store.decide(&fingerprint()).await.unwrap();

        for _ in 0..5 {
            assert_eq!(store.decide(&fingerprint()).await.unwrap(), Decision::Allow);
        }
    }

    #[tokio::test]
    async fn test_pairs_are_independent() {
        let store = MemoryStore::new(Duration::ZERO);
        store.decide(&fingerprint()).await.unwrap();

        let other = Fingerprint::new("alice@example.com", "carol@example.com");
        assert_eq!(store.decide(&other).await.unwrap(), Decision::New);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_delay_keeps_pair_pending() {
        let store = MemoryStore::new(Duration::from_secs(300));
        assert_eq!(store.decide(&fingerprint()).await.unwrap(), Decision::New);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(
            store.decide(&fingerprint()).await.unwrap(),
            Decision::Pending
        );

        tokio::time::advance(Duration::from_secs(240)).await;
        assert_eq!(store.decide(&fingerprint()).await.unwrap(), Decision::Allow);
        assert_eq!(store.decide(&fingerprint()).await.unwrap(), Decision::Allow);
    }
}
