//! Write-ahead log format and replay for the flat back-end. Every
//! transaction that touches a flat database writes `LOGNEW`, its data
//! records, then `LOGEND` or `LOGABORT`; the log is replayed from the last
//! `LOGNEW` forward whenever a flat database is opened after a crash.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use crate::error::{CResult, Error};
use crate::storage::{PhysicalStore, DB_FILE, LOG_FILE};
use crate::version::Version;

/// The log's tiny opcode vocabulary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Begins a new committed-but-not-yet-applied transaction.
    New = 100,
    /// Marks a transaction as fully applied; safe to treat as committed.
    End = 101,
    /// Marks a transaction as rolled back; its records must be ignored.
    Abort = 102,
    /// A single write within the bracketing New/End: `(offset, bytes)`.
    Data = 103,
}

impl Opcode {
    fn from_u8(b: u8) -> CResult<Self> {
        match b {
            100 => Ok(Opcode::New),
            101 => Ok(Opcode::End),
            102 => Ok(Opcode::Abort),
            103 => Ok(Opcode::Data),
            other => Err(Error::BadLog(format!("unknown log opcode {}", other))),
        }
    }
}

/// A decoded log record, in file order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Record {
    New { tid_epoch: u32, tid_counter: u32 },
    End,
    Abort,
    Data { offset: u64, bytes: Vec<u8> },
}

/// Appends a `LOGNEW` record, opening a new transaction in the log.
pub fn log_new(store: &mut dyn PhysicalStore, tid: (u32, u32)) -> CResult<()> {
    let mut buf = Vec::with_capacity(9);
    buf.write_u8(Opcode::New as u8)?;
    buf.write_u32::<BigEndian>(tid.0)?;
    buf.write_u32::<BigEndian>(tid.1)?;
    store.append(&buf)?;
    store.sync(LOG_FILE)
}

/// Appends a `LOGDATA` record carrying one buffered write.
pub fn log_data(store: &mut dyn PhysicalStore, offset: u64, bytes: &[u8]) -> CResult<()> {
    let mut buf = Vec::with_capacity(13 + bytes.len());
    buf.write_u8(Opcode::Data as u8)?;
    buf.write_u64::<BigEndian>(offset)?;
    buf.write_u32::<BigEndian>(bytes.len() as u32)?;
    buf.extend_from_slice(bytes);
    store.append(&buf)
}

/// Appends a `LOGEND` record, closing out a transaction as committed.
pub fn log_end(store: &mut dyn PhysicalStore) -> CResult<()> {
    store.append(&[Opcode::End as u8])?;
    store.sync(LOG_FILE)
}

/// Appends a `LOGABORT` record, closing out a transaction as rolled back.
pub fn log_abort(store: &mut dyn PhysicalStore) -> CResult<()> {
    store.append(&[Opcode::Abort as u8])?;
    store.sync(LOG_FILE)
}

/// Parses every well-formed record out of a raw log buffer, stopping (rather
/// than erroring) at the first truncated trailing record: a crash mid-append
/// must not prevent recovery of everything written before it.
pub fn parse_records(raw: &[u8]) -> Vec<Record> {
    let mut cursor = Cursor::new(raw);
    let mut records = Vec::new();
    loop {
        let op_byte = match cursor.read_u8() {
            Ok(b) => b,
            Err(_) => break,
        };
        let op = match Opcode::from_u8(op_byte) {
            Ok(op) => op,
            Err(_) => break,
        };
        let record = match op {
            Opcode::New => {
                let epoch = match cursor.read_u32::<BigEndian>() {
                    Ok(v) => v,
                    Err(_) => break,
                };
                let counter = match cursor.read_u32::<BigEndian>() {
                    Ok(v) => v,
                    Err(_) => break,
                };
                Record::New { tid_epoch: epoch, tid_counter: counter }
            }
            Opcode::End => Record::End,
            Opcode::Abort => Record::Abort,
            Opcode::Data => {
                let offset = match cursor.read_u64::<BigEndian>() {
                    Ok(v) => v,
                    Err(_) => break,
                };
                let len = match cursor.read_u32::<BigEndian>() {
                    Ok(v) => v,
                    Err(_) => break,
                } as usize;
                let start = cursor.position() as usize;
                let end = start + len;
                if end > raw.len() {
                    break;
                }
                let bytes = raw[start..end].to_vec();
                cursor.set_position(end as u64);
                Record::Data { offset, bytes }
            }
        };
        records.push(record);
    }
    records
}

/// Replays the log against the database file, applying any transaction
/// bracketed by `New`/`End` and discarding transactions left open or closed
/// with `Abort`. Returns the number of transactions applied.
pub fn replay(store: &mut dyn PhysicalStore, raw: &[u8]) -> CResult<u32> {
    let records = parse_records(raw);
    let mut applied = 0u32;
    let mut pending: Vec<(u64, Vec<u8>)> = Vec::new();
    let mut in_txn = false;

    for record in records {
        match record {
            Record::New { .. } => {
                pending.clear();
                in_txn = true;
            }
            Record::Data { offset, bytes } => {
                if in_txn {
                    pending.push((offset, bytes));
                }
            }
            Record::End => {
                if in_txn {
                    for (offset, bytes) in pending.drain(..) {
                        store.write(DB_FILE, offset, &bytes)?;
                    }
                    store.sync(DB_FILE)?;
                    applied += 1;
                }
                in_txn = false;
            }
            Record::Abort => {
                pending.clear();
                in_txn = false;
            }
        }
    }
    // A dangling New with no End/Abort is a crash mid-commit: its writes were
    // never acknowledged to any caller, so they're discarded, matching the
    // "torn write" handling flat databases rely on.
    Ok(applied)
}

/// Truncates the log file back to empty, called once replay has been
/// applied and the result synced to the database file.
pub fn truncate_log(store: &mut dyn PhysicalStore) -> CResult<()> {
    store.truncate(LOG_FILE, 0)?;
    store.sync(LOG_FILE)
}

/// Opens `store`'s flat database, replaying any outstanding log first. This
/// is the entry point `recovery`/startup calls before serving transactions.
pub fn recover(store: &mut dyn PhysicalStore) -> CResult<Version> {
    let len = store.file_len(LOG_FILE)? as usize;
    if len > 0 {
        let raw = store.read(LOG_FILE, 0, len)?;
        replay(store, &raw)?;
        truncate_log(store)?;
    }
    store.getlabel()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::flat::FlatStore;

    #[test]
    fn committed_transaction_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FlatStore::open_or_create(dir.path()).unwrap();

        log_new(&mut store, (2, 1)).unwrap();
        log_data(&mut store, 0, b"hello").unwrap();
        log_end(&mut store).unwrap();

        let raw = std::fs::read(dir.path().join("DBSYS1")).unwrap();
        let applied = replay(&mut store, &raw).unwrap();
        assert_eq!(applied, 1);
        assert_eq!(store.read(DB_FILE, 0, 5).unwrap(), b"hello");
    }

    #[test]
    fn aborted_transaction_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FlatStore::open_or_create(dir.path()).unwrap();

        log_new(&mut store, (2, 1)).unwrap();
        log_data(&mut store, 0, b"nope!").unwrap();
        log_abort(&mut store).unwrap();

        let raw = std::fs::read(dir.path().join("DBSYS1")).unwrap();
        let applied = replay(&mut store, &raw).unwrap();
        assert_eq!(applied, 0);
        assert_eq!(store.read(DB_FILE, 0, 5).unwrap(), vec![0; 5]);
    }

    #[test]
    fn truncated_trailing_record_is_ignored() {
        let mut raw = Vec::new();
        raw.write_u8(Opcode::New as u8).unwrap();
        raw.write_u32::<BigEndian>(2).unwrap();
        raw.write_u32::<BigEndian>(1).unwrap();
        raw.write_u8(Opcode::Data as u8).unwrap();
        raw.write_u64::<BigEndian>(0).unwrap();
        raw.write_u32::<BigEndian>(100).unwrap(); // claims 100 bytes, supplies none

        let records = parse_records(&raw);
        assert_eq!(records, vec![Record::New { tid_epoch: 2, tid_counter: 1 }]);
    }
}
