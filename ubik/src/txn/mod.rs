//! The transaction API: `BeginTrans`/`EndTrans`/`AbortTrans`,
//! `Read`/`Write`/`Seek`/`Flush`/`SetLock`, and `CheckCache`. This is the
//! library surface application code and the recovery/freeze layers both
//! build on.

pub mod cache;
pub mod raw;

use crate::context::Context;
use crate::error::{CResult, Error};
use crate::quorum::{self, DispatchFilter};
use crate::rpc::message::DiskRequest;
use crate::storage::{FileId, DB_FILE};
use crate::version::Version;
use crate::wal;

/// `readAny` modes for `BeginTrans`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadAny {
    /// Default: only observe the last value this process's own commits
    /// produced.
    Strict,
    /// Observe any available committed data.
    Any,
    /// `Any`, plus may read past an active write lock, relying on
    /// [`cache::CheckCache`] to notice the label has moved and re-derive
    /// whatever the caller cached.
    AnyPastWriteLock,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
}

/// A buffered write awaiting commit, so multiple writes can ship in one
/// bulk RPC.
struct PendingWrite {
    file: FileId,
    offset: u64,
    bytes: Vec<u8>,
}

/// A local transaction handle.
pub struct Transaction<'a> {
    ctx: &'a Context,
    pub mode: Mode,
    pub tid: (u32, u32),
    cursor: (FileId, u64),
    pending: Vec<PendingWrite>,
    ended: bool,
}

impl<'a> Transaction<'a> {
    /// `BeginTrans(db, mode, readAny)`. Write transactions require this
    /// site to be sync and advertised, and no conflicting activity flag
    /// set; they also broadcast the first `DISK_Begin` to the
    /// quorum, aborting locally on failure.
    pub async fn begin(ctx: &'a Context, mode: Mode, _read_any: ReadAny) -> CResult<Transaction<'a>> {
        match mode {
            Mode::Read => {
                let tid = ctx.vote.with(|v| v.known_write_tid.unwrap_or((0, 0)));
                Ok(Transaction { ctx, mode, tid, cursor: (DB_FILE, 0), pending: vec![], ended: false })
            }
            Mode::Write => {
                let now = std::time::Instant::now();
                let (is_sync, advertised) = ctx.vote.with(|v| (v.am_sync_site(now), v.sync_site_advertised()));
                if !is_sync || !advertised {
                    return Err(Error::NotSyncSite);
                }
                {
                    let hold = ctx.dbhold.lock().unwrap();
                    if hold.activity.blocks_write() {
                        return Err(Error::NotReady("database busy with writing/sending/receiving".into()));
                    }
                }
                let epoch = ctx.dbhold.lock().unwrap().label.epoch.max(Version::FIRST_REAL.epoch);
                let tid = (epoch, ctx.next_tid_counter());

                let result =
                    quorum::dispatch(&ctx.directory, &ctx.vote, DispatchFilter::FirstBegin, DiskRequest::Begin {
                        tid,
                        read_only: false,
                    })
                    .await?;
                if !result.reached(ctx.quorum_size()) {
                    return Err(Error::NoQuorum("failed to reach quorum on DISK_Begin".into()));
                }

                ctx.dbhold.lock().unwrap().activity.writing = true;
                ctx.vote.with(|v| v.known_write_tid = Some(tid));

                Ok(Transaction { ctx, mode, tid, cursor: (DB_FILE, 0), pending: vec![], ended: false })
            }
        }
    }

    /// `Seek(file, offset)`: repositions the cursor used by subsequent
    /// cursor-relative `Read`/`Write` calls.
    pub fn seek(&mut self, file: FileId, offset: u64) {
        self.cursor = (file, offset);
    }

    /// `Read(len)`: reads through the buffer cache at the current cursor,
    /// advancing it.
    pub fn read(&mut self, len: usize) -> CResult<Vec<u8>> {
        let (file, offset) = self.cursor;
        let page = (offset / crate::buffer::PAGE_SIZE as u64) as u32;
        let page_offset = (offset % crate::buffer::PAGE_SIZE as u64) as usize;

        let mut hold = self.ctx.dbhold.lock().unwrap();
        let handle = self.ctx.buffers.read(&mut *hold.store, 0, file, page, self.mode == Mode::Write)?;
        drop(hold);
        let page_bytes = self.ctx.buffers.bytes(handle);
        self.ctx.buffers.release(handle, false);

        let available = page_bytes.len().saturating_sub(page_offset);
        let take = available.min(len);
        self.cursor = (file, offset + take as u64);
        Ok(page_bytes[page_offset..page_offset + take].to_vec())
    }

    /// `Write(bytes)`: buffers a write at the current cursor, to be shipped
    /// in one bulk RPC at commit time. Only valid on a write transaction.
    pub fn write(&mut self, bytes: &[u8]) -> CResult<()> {
        if self.mode != Mode::Write {
            return Err(Error::BadType("write on a read transaction".into()));
        }
        let (file, offset) = self.cursor;
        self.pending.push(PendingWrite { file, offset, bytes: bytes.to_vec() });
        self.cursor = (file, offset + bytes.len() as u64);
        Ok(())
    }

    /// `Flush()`: applies buffered writes to the buffer cache without
    /// committing, so a long write transaction can reclaim the pending
    /// vector without losing data. Does not touch the log -- `LOGNEW`
    /// brackets a commit, not an in-progress write, so logging happens only
    /// in [`Self::end`].
    pub fn flush_local(&mut self) -> CResult<()> {
        let mut hold = self.ctx.dbhold.lock().unwrap();
        for pw in self.pending.drain(..) {
            let page = (pw.offset / crate::buffer::PAGE_SIZE as u64) as u32;
            let page_offset = (pw.offset % crate::buffer::PAGE_SIZE as u64) as usize;
            let handle = self.ctx.buffers.new_page(0, pw.file, page).or_else(|_| {
                self.ctx.buffers.read(&mut *hold.store, 0, pw.file, page, true)
            })?;
            self.ctx.buffers.write(handle, page_offset, &pw.bytes)?;
            self.ctx.buffers.release(handle, true);
        }
        Ok(())
    }

    /// `EndTrans()`: the write commit protocol -- `LOGNEW`, a `LOGDATA` per
    /// buffered write as it lands in the buffer cache, `DFlush`/`DSync`,
    /// `LOGEND`, relabel, then propagate the writes and the new label to the
    /// quorum before `DISK_Commit`/`DISK_ReleaseLocks`.
    pub async fn end(mut self) -> CResult<Version> {
        if self.mode != Mode::Write {
            return Ok(self.ctx.dbhold.lock().unwrap().label);
        }

        let pending = std::mem::take(&mut self.pending);
        let writes_for_quorum: Vec<(i32, u64, Vec<u8>)> =
            pending.iter().map(|pw| (pw.file, pw.offset, pw.bytes.clone())).collect();

        let (new_version, relabeled) = {
            let mut hold = self.ctx.dbhold.lock().unwrap();

            wal::log_new(&mut *hold.store, self.tid)?;
            for pw in &pending {
                wal::log_data(&mut *hold.store, pw.offset, &pw.bytes)?;
                let page = (pw.offset / crate::buffer::PAGE_SIZE as u64) as u32;
                let page_offset = (pw.offset % crate::buffer::PAGE_SIZE as u64) as usize;
                let handle = self.ctx.buffers.new_page(0, pw.file, page).or_else(|_| {
                    self.ctx.buffers.read(&mut *hold.store, 0, pw.file, page, true)
                })?;
                self.ctx.buffers.write(handle, page_offset, &pw.bytes)?;
                self.ctx.buffers.release(handle, true);
            }

            let mut next = hold.label;
            let relabeled = next.epoch <= 1;
            if relabeled {
                let fresh = Version::fresh_epoch();
                Version::validate_epoch(fresh)?;
                next.epoch = fresh;
                next.counter = 1;
            } else {
                next.counter += 1;
            }

            self.ctx.buffers.flush(&mut *hold.store)?;
            self.ctx.buffers.sync(&mut *hold.store)?;
            wal::log_end(&mut *hold.store)?;
            hold.store.setlabel(next)?;
            wal::truncate_log(&mut *hold.store)?;
            hold.label = next;
            hold.activity.writing = false;
            (next, relabeled)
        };

        if relabeled {
            // Best-effort: peers also learn the new label via `DISK_Commit`
            // below, but broadcasting it as soon as it's known lets a peer
            // that only sees `WriteV` reject stale writes sooner.
            let _ = quorum::dispatch(&self.ctx.directory, &self.ctx.vote, DispatchFilter::Eligible, DiskRequest::SetVersion {
                tid: self.tid,
                version: new_version.into(),
            })
            .await;
        }

        if !writes_for_quorum.is_empty() {
            let bulk = quorum::dispatch(&self.ctx.directory, &self.ctx.vote, DispatchFilter::Eligible, DiskRequest::WriteV {
                tid: self.tid,
                writes: writes_for_quorum.clone(),
            })
            .await;
            if bulk.is_err() {
                // Fall back to per-write dispatch for peers on a dialect
                // that never learned `WriteV`.
                for (file, pos, data) in &writes_for_quorum {
                    let _ = quorum::dispatch(&self.ctx.directory, &self.ctx.vote, DispatchFilter::Eligible, DiskRequest::Write {
                        tid: self.tid,
                        file: *file,
                        pos: *pos,
                        data: data.clone(),
                    })
                    .await;
                }
            }
        }

        let result = quorum::dispatch(&self.ctx.directory, &self.ctx.vote, DispatchFilter::Eligible, DiskRequest::Commit {
            tid: self.tid,
            version: new_version.into(),
        })
        .await?;
        quorum::stamp_committed_version(&self.ctx.vote, &result.acked, new_version);

        // Best-effort: a local quorum was already reached at
        // `DISK_Begin`, so an aggregate commit failure here does not fail
        // the client -- it only shrinks `result.acked` for the subsequent
        // release-locks wait.
        let _ = quorum::dispatch(&self.ctx.directory, &self.ctx.vote, DispatchFilter::Eligible, DiskRequest::ReleaseLocks {
            tid: self.tid,
        })
        .await;

        self.ctx.vote.with(|v| v.known_write_tid = None);
        self.ended = true;
        Ok(new_version)
    }

    /// `CheckCache`: escalates to `updater` only when the database's current
    /// label no longer matches what `cache` last promoted to, so a reader
    /// using [`ReadAny::AnyPastWriteLock`] can re-derive cached state under a
    /// fresh read rather than trust a view a concurrent commit invalidated.
    pub fn check_cache<F>(&self, cache: &cache::CheckCache, updater: F) -> CResult<()>
    where
        F: FnOnce(&Transaction<'a>) -> CResult<()>,
    {
        let current = self.ctx.dbhold.lock().unwrap().label;
        cache.check(current, || updater(self))
    }

    /// `AbortTrans()`: append `LOGABORT`, truncate the log, `DAbort`.
    pub async fn abort(mut self) -> CResult<()> {
        if self.mode == Mode::Write {
            let mut hold = self.ctx.dbhold.lock().unwrap();
            wal::log_abort(&mut *hold.store)?;
            wal::truncate_log(&mut *hold.store)?;
            self.ctx.buffers.abort(0);
            hold.activity.writing = false;
            drop(hold);

            let _ = quorum::dispatch(&self.ctx.directory, &self.ctx.vote, DispatchFilter::Eligible, DiskRequest::Abort {
                tid: self.tid,
            })
            .await;
            self.ctx.vote.with(|v| v.known_write_tid = None);
        }
        self.ended = true;
        Ok(())
    }
}

impl<'a> Drop for Transaction<'a> {
    fn drop(&mut self) {
        if !self.ended && self.mode == Mode::Write {
            log::warn!("write transaction {:?} dropped without end()/abort()", self.tid);
            self.ctx.buffers.abort(0);
            self.ctx.dbhold.lock().unwrap().activity.writing = false;
        }
    }
}
