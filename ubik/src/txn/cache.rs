//! `CheckCache`: the escalation hook a reader running with
//! `ReadAny::AnyPastWriteLock` consults before trusting state it has
//! cached from an earlier pass over the database. When the cache's
//! remembered version no longer matches the database's current label, the
//! caller's updater re-derives whatever it cached under a fresh read, and the
//! cache is promoted to the new version only if that succeeds.

use std::sync::Mutex;

use crate::error::CResult;
use crate::version::Version;

/// One cached view's version marker.
pub struct CheckCache {
    cached_version: Mutex<Version>,
}

impl CheckCache {
    pub fn new() -> Self {
        CheckCache { cached_version: Mutex::new(Version::default()) }
    }

    /// Escalates to `updater` only when `current` disagrees with the version
    /// this cache last recorded. On success the cache is promoted to
    /// `current`, so the next caller with the same `current` skips the
    /// updater; on failure the cache is cleared so the next caller retries
    /// rather than trusting a half-applied update.
    pub fn check<F>(&self, current: Version, updater: F) -> CResult<()>
    where
        F: FnOnce() -> CResult<()>,
    {
        if *self.cached_version.lock().unwrap() == current {
            return Ok(());
        }
        match updater() {
            Ok(()) => {
                *self.cached_version.lock().unwrap() = current;
                Ok(())
            }
            Err(e) => {
                *self.cached_version.lock().unwrap() = Version::default();
                Err(e)
            }
        }
    }
}

impl Default for CheckCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn stale_cache_runs_updater_and_promotes() {
        let cache = CheckCache::new();
        let calls = AtomicUsize::new(0);
        let v = Version::new(2, 5);

        cache.check(v, || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }).unwrap();
        cache.check(v, || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_updater_clears_cache_for_retry() {
        let cache = CheckCache::new();
        let v = Version::new(2, 5);

        let err = cache.check(v, || Err(crate::error::Error::Internal("boom".into())));
        assert!(err.is_err());

        let calls = AtomicUsize::new(0);
        cache.check(v, || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fresh_cache_at_default_version_skips_updater() {
        let cache = CheckCache::new();
        let calls = AtomicUsize::new(0);
        cache.check(Version::default(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
