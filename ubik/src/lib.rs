//! `ubik`: a small quorum-replicated key/value database engine, modeled on
//! the sync-site election, write-ahead log, and online database-replacement
//! protocol of OpenAFS's ubik subsystem.
//!
//! A database is opened on one of two interchangeable physical back-ends
//! (flat file or log-structured KV store, see [`storage`]), written to only
//! through the quorum-aware [`txn`] transaction API, and kept in sync across
//! peers by the [`vote`] election state machine and the [`recovery`] loop.
//! [`freeze`] provides an online, atomic way to replace the live database
//! out from under a running quorum.
//!
//! ## Getting started
//!
//! ```rust
//! use ubik::error::Error;
//! use ubik::storage::engine::Engine;
//! use ubik::storage::log_cask::LogCask;
//!
//! fn run() -> Result<(), Error> {
//!     let dir = tempfile::tempdir().unwrap();
//!     let mut engine = LogCask::new(dir.path().join("kvdb"))?;
//!     engine.set(b"a", vec![0x01])?;
//!     assert_eq!(engine.get(b"a")?, Some(vec![0x01]));
//!     engine.flush()?;
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod freeze;
pub mod quorum;
pub mod recovery;
pub mod rpc;
pub mod storage;
pub mod txn;
pub mod version;
pub mod vldb;
pub mod vote;
pub mod wal;

#[cfg(test)]
mod tests {
    use crate::error::Error;
    use crate::storage::engine::Engine;
    use crate::storage::log_cask::LogCask;

    #[test]
    fn engine_roundtrip_smoke_test() -> Result<(), Error> {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = LogCask::new(dir.path().join("kvdb"))?;
        engine.set(b"b", vec![0x01])?;
        engine.set(b"b", vec![0x02])?;
        engine.set(b"e", vec![0x05])?;
        engine.delete(b"e")?;
        engine.set(b"a", vec![0x01])?;

        assert_eq!(
            vec![(b"a".to_vec(), vec![0x01]), (b"b".to_vec(), vec![0x02])],
            engine.scan(..).collect::<Result<Vec<_>, Error>>()?,
        );

        engine.flush()?;
        Ok(())
    }
}
