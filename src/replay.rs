//! Single-use enforcement for delegation token identifiers.
//!
//! Every validated delegation token carries a `jti`. The guard records each
//! consumed identifier until the token's own expiry; a second consumption of
//! a live identifier is a replay. Entries are bounded by an LRU cache so the
//! guard cannot grow without limit, and identifiers whose expiry has passed
//! are treated as fresh since the expiry check already rejects those tokens.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use chrono::Utc;
use lru::LruCache;

use crate::error::IssuanceError;

/// In-memory consumed-`jti` cache.
pub struct ReplayGuard {
    seen: Mutex<LruCache<String, i64>>,
}

impl ReplayGuard {
    /// Creates a guard holding at most `capacity` identifiers.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            seen: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Consumes a token identifier, failing if it was already consumed and
    /// the original token has not yet expired.
    pub fn consume(&self, jti: &str, exp: i64) -> Result<(), IssuanceError> {
        self.consume_at(jti, exp, Utc::now().timestamp())
    }

    fn consume_at(&self, jti: &str, exp: i64, now: i64) -> Result<(), IssuanceError> {
        let mut seen = self
            .seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(&stored_exp) = seen.get(jti) {
            if stored_exp > now {
                return Err(IssuanceError::TokenReplayed);
            }
        }

        seen.put(jti.to_string(), exp);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_use_is_accepted() {
        let guard = ReplayGuard::new(16);
        assert!(guard.consume_at("jti-1", 1000, 0).is_ok());
    }

    #[test]
    fn second_use_of_live_token_is_a_replay() {
        let guard = ReplayGuard::new(16);
        guard.consume_at("jti-1", 1000, 0).unwrap();

        let err = guard.consume_at("jti-1", 1000, 10).unwrap_err();
        assert!(matches!(err, IssuanceError::TokenReplayed));
    }

    #[test]
    fn expired_identifier_can_be_reused() {
        let guard = ReplayGuard::new(16);
        guard.consume_at("jti-1", 100, 0).unwrap();

        // Past the recorded expiry the entry no longer blocks consumption.
        assert!(guard.consume_at("jti-1", 500, 200).is_ok());
    }

    #[test]
    fn distinct_identifiers_do_not_collide() {
        let guard = ReplayGuard::new(16);
        guard.consume_at("jti-1", 1000, 0).unwrap();
        assert!(guard.consume_at("jti-2", 1000, 0).is_ok());
    }

    #[test]
    fn capacity_bounds_the_cache() {
        let guard = ReplayGuard::new(2);
        guard.consume_at("jti-1", 1000, 0).unwrap();
        guard.consume_at("jti-2", 1000, 0).unwrap();
        guard.consume_at("jti-3", 1000, 0).unwrap();

        // "jti-1" was evicted; replaying it now goes unnoticed. This is the
        // accepted trade-off of a bounded cache.
        assert!(guard.consume_at("jti-1", 1000, 0).is_ok());
        // "jti-3" is still tracked.
        assert!(guard.consume_at("jti-3", 1000, 0).is_err());
    }

    #[test]
    fn zero_capacity_falls_back_to_one_entry() {
        let guard = ReplayGuard::new(0);
        guard.consume_at("jti-1", 1000, 0).unwrap();
        assert!(guard.consume_at("jti-1", 1000, 0).is_err());
    }
}
