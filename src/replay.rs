//! Replay suppression keyed by idempotency fingerprints.
//!
//! A fingerprint is the pair `(idempotency_key, request_hash)`. The first
//! admission within the TTL is `Fresh`; any repeat is `Replay` and the
//! pipeline denies it with `REPLAY_DETECTED`. Requests without an
//! idempotency key bypass the store entirely.
//!
//! Expired entries are collected by a background sweeper ticking at half the
//! TTL, cancelled through the process-wide shutdown token.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Replay fingerprint: idempotency key plus canonical request hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub idempotency_key: String,
    pub request_hash: String,
}

/// Outcome of [`ReplayStore::check_and_store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First sighting within the TTL; the fingerprint is now remembered.
    Fresh,
    /// Seen before and not yet expired.
    Replay,
}

pub struct ReplayStore {
    entries: Mutex<HashMap<Fingerprint, Instant>>,
    ttl: Duration,
}

impl ReplayStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Atomically test and remember a fingerprint.
    ///
    /// An expired entry counts as unseen and is refreshed in place.
    pub fn check_and_store(&self, fingerprint: Fingerprint) -> Admission {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("replay store lock poisoned");
        match entries.get(&fingerprint) {
            Some(expires_at) if now < *expires_at => Admission::Replay,
            _ => {
                entries.insert(fingerprint, now + self.ttl);
                Admission::Fresh
            }
        }
    }

    /// Drop every entry whose expiry has passed. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("replay store lock poisoned");
        let before = entries.len();
        entries.retain(|_, expires_at| now < *expires_at);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("replay store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run the expiry sweeper on the tracker until the token is cancelled.
    ///
    /// The interval is half the TTL, floored at one second so a tiny TTL
    /// cannot turn the sweeper into a busy loop. The task registers with the
    /// tracker so shutdown can await its completion.
    pub fn spawn_sweeper(self: &Arc<Self>, token: CancellationToken, tracker: &TaskTracker) {
        let store = Arc::clone(self);
        let period = (self.ttl / 2).max(Duration::from_secs(1));
        tracker.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!("replay sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = store.sweep();
                        if removed > 0 {
                            tracing::debug!(removed, remaining = store.len(), "swept replay entries");
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(key: &str) -> Fingerprint {
        Fingerprint {
            idempotency_key: key.to_string(),
            request_hash: "0xabc".to_string(),
        }
    }

    #[test]
    fn second_sighting_is_replay() {
        let store = ReplayStore::new(Duration::from_secs(60));
        assert_eq!(store.check_and_store(fp("k")), Admission::Fresh);
        assert_eq!(store.check_and_store(fp("k")), Admission::Replay);
    }

    #[test]
    fn different_hash_is_fresh() {
        let store = ReplayStore::new(Duration::from_secs(60));
        store.check_and_store(fp("k"));
        let other = Fingerprint {
            idempotency_key: "k".to_string(),
            request_hash: "0xdef".to_string(),
        };
        assert_eq!(store.check_and_store(other), Admission::Fresh);
    }

    #[test]
    fn expired_entry_is_fresh_again() {
        let store = ReplayStore::new(Duration::from_millis(0));
        assert_eq!(store.check_and_store(fp("k")), Admission::Fresh);
        assert_eq!(store.check_and_store(fp("k")), Admission::Fresh);
    }

    #[test]
    fn sweep_discards_expired() {
        let store = ReplayStore::new(Duration::from_millis(0));
        store.check_and_store(fp("a"));
        store.check_and_store(fp("b"));
        assert_eq!(store.sweep(), 2);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn sweeper_stops_on_cancel() {
        let store = Arc::new(ReplayStore::new(Duration::from_secs(2)));
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        store.spawn_sweeper(token.clone(), &tracker);
        token.cancel();
        tracker.close();
        tracker.wait().await;
    }
}
