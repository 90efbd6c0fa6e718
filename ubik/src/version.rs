//! Database versions: `(epoch, counter)`, totally ordered lexicographically.

use std::time::{SystemTime, UNIX_EPOCH};
use serde_derive::{Deserialize, Serialize};

/// Seconds-since-epoch floor below which a label is never valid. Mirrors the
/// original ubik's `MILESTONE` build-date guard: any epoch at or below this
/// value is obviously not a timestamp taken after this code existed.
pub const MILESTONE: u32 = 1_000_000_000;

/// A database version. `epoch` is seconds-since-a-known-milestone, bumped
/// only when a site relabels a freshly promoted or freshly fetched database;
/// `counter` is bumped by exactly one per accepted write transaction at the
/// sync site. Not to be confused with a transaction's `tid` counter, which
/// advances by two per `BeginTrans` and lives in [`crate::context::Context`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub epoch: u32,
    pub counter: u32,
}

/// 64-bit wire-compatible encoding of a [`Version`], used by remote peers
/// that carry versions as XDR `hyper` pairs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionWire {
    pub epoch: u64,
    pub counter: u64,
}

impl From<Version> for VersionWire {
    fn from(v: Version) -> Self {
        VersionWire { epoch: v.epoch as u64, counter: v.counter as u64 }
    }
}

impl From<VersionWire> for Version {
    fn from(w: VersionWire) -> Self {
        Version { epoch: w.epoch as u32, counter: w.counter as u32 }
    }
}

impl Version {
    /// The label a freshly initialized, empty database carries.
    pub const NEW: Version = Version { epoch: 1, counter: 1 };

    /// The label assigned the first time quorum is established, so that
    /// clients can tell a "real" database from a never-written one.
    pub const FIRST_REAL: Version = Version { epoch: 2, counter: 1 };

    pub fn new(epoch: u32, counter: u32) -> Self {
        Version { epoch, counter }
    }

    /// True for `(epoch > 1, counter >= 1)`: a database that has actually
    /// been written to by a quorum, as opposed to the just-initialized label.
    pub fn is_real(&self) -> bool {
        self.epoch > 1 && self.counter >= 1
    }

    /// Validates an epoch against the local clock: must be strictly above
    /// [`MILESTONE`] and not in the future.
    pub fn validate_epoch(epoch: u32) -> crate::error::CResult<()> {
        let now = now_epoch_secs();
        if epoch <= MILESTONE {
            return Err(crate::error::Error::BadVersion(format!(
                "epoch {} at or below milestone {}",
                epoch, MILESTONE
            )));
        }
        if epoch > now {
            return Err(crate::error::Error::BadVersion(format!(
                "epoch {} is in the future (now={})",
                epoch, now
            )));
        }
        Ok(())
    }

    /// A fresh epoch derived from the wall clock, for use when relabeling a
    /// database the first time a site becomes sync. Callers must be
    /// prepared to wait for the clock to advance rather than
    /// predict the next epoch, since a concurrent `install()` may already be
    /// using the current second.
    pub fn fresh_epoch() -> u32 {
        now_epoch_secs()
    }
}

fn now_epoch_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_lexicographic() {
        assert!(Version::new(1, 5) < Version::new(2, 1));
        assert!(Version::new(2, 1) < Version::new(2, 2));
        assert_eq!(Version::new(2, 2), Version::new(2, 2));
    }

    #[test]
    fn new_label_is_not_real() {
        assert!(!Version::NEW.is_real());
        assert!(Version::FIRST_REAL.is_real());
    }

    #[test]
    fn validate_epoch_rejects_milestone_and_future() {
        assert!(Version::validate_epoch(MILESTONE).is_err());
        assert!(Version::validate_epoch(u32::MAX).is_err());
        assert!(Version::validate_epoch(now_epoch_secs()).is_ok());
    }
}
