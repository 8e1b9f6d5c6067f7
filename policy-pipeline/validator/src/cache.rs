use crate::result::ValidationResult;
use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use policy_pipeline_core::Fingerprint;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::watch;

/// Results are only reusable while the tool version is unchanged.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct CacheKey {
    pub fingerprint: Fingerprint,
    pub tool_version: Arc<str>,
}

/// Caches verdicts and coalesces concurrent validations of the same key.
#[derive(Debug)]
pub(crate) struct ResultCache {
    ttl: Duration,
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<CacheKey, Entry>,
    inflight: HashMap<CacheKey, watch::Receiver<Option<ValidationResult>>>,
}

#[derive(Debug)]
struct Entry {
    result: ValidationResult,
    expires: Instant,
}

pub(crate) enum Claim {
    Cached(ValidationResult),

    /// Another caller is validating the same content.
    Pending(watch::Receiver<Option<ValidationResult>>),

    /// The caller must run the validation and complete the flight.
    Leader(Flight),
}

/// The right to validate a key. Dropping an incomplete flight releases any
/// waiters so that one of them may take over.
pub(crate) struct Flight {
    cache: Arc<ResultCache>,
    key: CacheKey,
    tx: watch::Sender<Option<ValidationResult>>,
}

// === impl ResultCache ===

impl ResultCache {
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            ttl,
            state: Mutex::new(State::default()),
        })
    }

    pub fn claim(self: &Arc<Self>, key: CacheKey) -> Claim {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(entry) = state.entries.get(&key) {
            if entry.expires > Instant::now() {
                return Claim::Cached(entry.result.clone());
            }
            state.entries.remove(&key);
        }

        if let Some(rx) = state.inflight.get(&key) {
            return Claim::Pending(rx.clone());
        }

        let (tx, rx) = watch::channel(None);
        state.inflight.insert(key.clone(), rx);
        Claim::Leader(Flight {
            cache: self.clone(),
            key,
            tx,
        })
    }

    /// Drops every expired entry. Returns the number evicted.
    pub fn purge_expired(&self) -> usize {
        let mut state = self.state.lock();
        let now = Instant::now();
        let before = state.entries.len();
        state.entries.retain(|_, e| e.expires > now);
        before - state.entries.len()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }
}

// === impl Flight ===

impl Flight {
    /// Publishes the result to waiters, caching it if it is a verdict.
    pub fn complete(self, result: &ValidationResult) {
        let mut state = self.cache.state.lock();
        if result.status.is_verdict() && !self.cache.ttl.is_zero() {
            state.entries.insert(
                self.key.clone(),
                Entry {
                    result: result.clone(),
                    expires: Instant::now() + self.cache.ttl,
                },
            );
        }
        state.inflight.remove(&self.key);
        drop(state);
        self.tx.send_replace(Some(result.clone()));
    }
}

impl Drop for Flight {
    fn drop(&mut self) {
        // Once completed, the entry was already removed and the sender holds
        // a value. Otherwise waiters observe a closed channel and retry.
        if self.tx.borrow().is_none() {
            self.cache.state.lock().inflight.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::ValidationStatus;

    fn key(content: &str) -> CacheKey {
        CacheKey {
            fingerprint: Fingerprint::of(content),
            tool_version: Arc::from("v1"),
        }
    }

    fn result(status: ValidationStatus) -> ValidationResult {
        ValidationResult {
            status,
            findings: vec![],
            fingerprint: Fingerprint::of("x"),
            tool_version: "v1".to_string(),
            elapsed: Duration::from_millis(3),
            cache_hit: false,
        }
    }

    #[test]
    fn verdicts_are_cached() {
        let cache = ResultCache::new(Duration::from_secs(60));
        let Claim::Leader(flight) = cache.claim(key("a")) else {
            panic!("first claim must lead");
        };
        flight.complete(&result(ValidationStatus::Valid));
        assert!(matches!(cache.claim(key("a")), Claim::Cached(_)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn tool_failures_are_not_cached() {
        let cache = ResultCache::new(Duration::from_secs(60));
        let Claim::Leader(flight) = cache.claim(key("a")) else {
            panic!("first claim must lead");
        };
        flight.complete(&result(ValidationStatus::Timeout));
        assert!(matches!(cache.claim(key("a")), Claim::Leader(_)));
    }

    #[test]
    fn tool_version_is_part_of_the_key() {
        let cache = ResultCache::new(Duration::from_secs(60));
        let Claim::Leader(flight) = cache.claim(key("a")) else {
            panic!("first claim must lead");
        };
        flight.complete(&result(ValidationStatus::Valid));

        let upgraded = CacheKey {
            tool_version: Arc::from("v2"),
            ..key("a")
        };
        assert!(matches!(cache.claim(upgraded), Claim::Leader(_)));
    }

    #[tokio::test]
    async fn waiters_receive_the_leaders_result() {
        let cache = ResultCache::new(Duration::from_secs(60));
        let Claim::Leader(flight) = cache.claim(key("a")) else {
            panic!("first claim must lead");
        };
        let Claim::Pending(mut rx) = cache.claim(key("a")) else {
            panic!("second claim must wait");
        };
        flight.complete(&result(ValidationStatus::Invalid));
        let published = rx.wait_for(Option::is_some).await.unwrap().clone();
        assert_eq!(published.map(|r| r.status), Some(ValidationStatus::Invalid));
    }

    #[tokio::test]
    async fn abandoned_flights_release_waiters() {
        let cache = ResultCache::new(Duration::from_secs(60));
        let Claim::Leader(flight) = cache.claim(key("a")) else {
            panic!("first claim must lead");
        };
        let Claim::Pending(mut rx) = cache.claim(key("a")) else {
            panic!("second claim must wait");
        };
        drop(flight);
        assert!(rx.wait_for(Option::is_some).await.is_err());
        assert!(matches!(cache.claim(key("a")), Claim::Leader(_)));
    }

    #[test]
    fn purge_drops_expired_entries() {
        let cache = ResultCache::new(Duration::from_nanos(1));
        let Claim::Leader(flight) = cache.claim(key("a")) else {
            panic!("first claim must lead");
        };
        flight.complete(&result(ValidationStatus::Valid));
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 0);
    }
}
