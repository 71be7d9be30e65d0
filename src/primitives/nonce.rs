//! Replay detection through remembered nonces.
//!
//! A replay protected message carries a random token together with its creation time. The
//! receiving party stores every such pair it accepts, and a pair that is already stored marks the
//! message as a replay. Only pairs younger than the maximum message age need to be kept, as older
//! messages are rejected by expiration anyways.
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};

use super::Time;

/// Remembers nonces for replay detection.
///
/// The check for a previous occurrence and the insertion must be one atomic operation. Otherwise
/// two concurrent requests carrying the same nonce could both observe it as new. A store shared
/// between several processes has to provide the same guarantee, for example through a unique
/// constraint on the stored triple.
pub trait NonceStore: Send + Sync {
    /// Store the nonce, returning `Ok(false)` if it was seen before or is too old to be checked.
    ///
    /// The context separates independent nonce spaces, such as nonces chosen by different
    /// providers.
    fn store_nonce(&self, context: Option<&str>, nonce: &str, timestamp: Time) -> Result<bool, ()>;
}

/// An in-memory nonce store.
///
/// Nonces older than the maximum age are purged lazily whenever a new nonce is stored.
#[derive(Debug)]
pub struct NonceMap {
    maximum_age: Duration,
    seen: Mutex<BTreeSet<(Time, String, String)>>,
}

impl NonceMap {
    /// Create a store remembering nonces for `maximum_age`.
    ///
    /// This must be at least the maximum message age used by the expiration check, or replays
    /// of old messages could go undetected.
    pub fn new(maximum_age: Duration) -> Self {
        NonceMap {
            maximum_age,
            seen: Mutex::new(BTreeSet::new()),
        }
    }

    /// The number of nonces currently remembered.
    pub fn len(&self) -> usize {
        self.seen.lock().map(|seen| seen.len()).unwrap_or(0)
    }

    /// Whether no nonce is remembered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NonceStore for NonceMap {
    fn store_nonce(&self, context: Option<&str>, nonce: &str, timestamp: Time) -> Result<bool, ()> {
        let now = Utc::now();
        let cutoff = now - self.maximum_age;
        if timestamp < cutoff {
            debug!("Refusing to store nonce older than the maximum age");
            return Ok(false);
        }

        let mut seen = self.seen.lock().map_err(|_| ())?;

        // Everything sorts by timestamp first, so the expired prefix is split off in one go.
        let keep = seen.split_off(&(cutoff, String::new(), String::new()));
        *seen = keep;

        let entry = (timestamp, context.unwrap_or("").to_string(), nonce.to_string());
        Ok(seen.insert(entry))
    }
}

impl<'a, S: NonceStore + ?Sized> NonceStore for &'a S {
    fn store_nonce(&self, context: Option<&str>, nonce: &str, timestamp: Time) -> Result<bool, ()> {
        (**self).store_nonce(context, nonce, timestamp)
    }
}

impl<S: NonceStore + ?Sized> NonceStore for Box<S> {
    fn store_nonce(&self, context: Option<&str>, nonce: &str, timestamp: Time) -> Result<bool, ()> {
        (**self).store_nonce(context, nonce, timestamp)
    }
}

impl<S: NonceStore + ?Sized> NonceStore for Arc<S> {
    fn store_nonce(&self, context: Option<&str>, nonce: &str, timestamp: Time) -> Result<bool, ()> {
        (**self).store_nonce(context, nonce, timestamp)
    }
}

#[cfg(test)]
/// Tests for nonce stores.
pub mod tests {
    use super::*;
    use std::thread;

    /// Tests the replay detection every nonce store must provide.
    ///
    /// The store must accept nonces that are at most a minute old.
    pub fn simple_test_suite(store: &dyn NonceStore) {
        let now = Utc::now();
        assert_eq!(store.store_nonce(None, "abc", now), Ok(true));
        assert_eq!(store.store_nonce(None, "abc", now), Ok(false));

        // Any part of the triple distinguishes nonces.
        assert_eq!(store.store_nonce(Some("https://op.example/"), "abc", now), Ok(true));
        assert_eq!(store.store_nonce(None, "abd", now), Ok(true));
        let earlier = now - Duration::seconds(30);
        assert_eq!(store.store_nonce(None, "abc", earlier), Ok(true));
        assert_eq!(store.store_nonce(None, "abc", earlier), Ok(false));
    }

    #[test]
    fn map_test_suite() {
        simple_test_suite(&NonceMap::new(Duration::minutes(10)));
    }

    #[test]
    fn too_old_is_refused() {
        let store = NonceMap::new(Duration::minutes(10));
        let old = Utc::now() - Duration::minutes(11);
        assert_eq!(store.store_nonce(None, "old", old), Ok(false));
        assert!(store.is_empty());
    }

    #[test]
    fn expired_nonces_are_purged() {
        let store = NonceMap::new(Duration::seconds(2));
        let now = Utc::now();
        assert_eq!(store.store_nonce(None, "first", now - Duration::seconds(1)), Ok(true));
        assert_eq!(store.len(), 1);
        thread::sleep(std::time::Duration::from_millis(1500));
        assert_eq!(store.store_nonce(None, "second", Utc::now()), Ok(true));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn concurrent_stores_accept_once() {
        let store = Arc::new(NonceMap::new(Duration::minutes(10)));
        let timestamp = Utc::now();
        let accepted: usize = (0..8)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || store.store_nonce(None, "shared", timestamp).unwrap())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| handle.join().unwrap() as usize)
            .sum();
        assert_eq!(accepted, 1);
    }
}
