//! Interactive debug shell: a thin REPL over a single RPC connection to a
//! running `ubikd`, for poking at `GetVersion`/`Read`/`Write`/`Freeze`
//! without writing a throwaway client each time. Lines are whitespace
//! tokenized; unrecognized input prints usage instead of failing silently.

use std::io::{BufRead, Write};
use std::net::SocketAddr;

use ubik::error::{CResult, Error};
use ubik::rpc::message::{DiskRequest, DiskResponse, Request, Response, VoteRequest, VoteResponse};
use ubik::rpc::transport::Connection;
use ubik::version::VersionWire;

pub struct Session {
    conn: Connection,
}

impl Session {
    pub async fn connect(addr: SocketAddr) -> CResult<Self> {
        Ok(Session { conn: Connection::connect(addr).await? })
    }

    /// Reads lines from `input` until EOF or a `quit`/`exit` command,
    /// writing prompts and responses to `output`.
    pub async fn run_repl(&mut self, input: impl BufRead, mut output: impl Write) -> CResult<()> {
        writeln!(
            output,
            "ubikctl debug shell. commands: getversion | read <file> | write <file> <pos> <hex> | \
             freeze-begin | freeze-install <freeze_id> <old_epoch> <old_counter> <new_epoch> <new_counter> | \
             freeze-end <freeze_id> | debug | quit"
        )
        .ok();
        for line in input.lines() {
            let line = line.map_err(|e| Error::Io(e.to_string()))?;
            let words: Vec<&str> = line.split_whitespace().collect();
            match words.as_slice() {
                [] => continue,
                ["quit"] | ["exit"] => return Ok(()),
                ["getversion"] => self.getversion(&mut output).await?,
                ["read", file] => self.read_file(file, &mut output).await?,
                ["write", file, pos, hex] => self.write_file(file, pos, hex, &mut output).await?,
                ["freeze-begin"] => self.freeze_begin(&mut output).await?,
                ["freeze-install", freeze_id, oe, oc, ne, nc] => {
                    self.freeze_install(freeze_id, oe, oc, ne, nc, &mut output).await?
                }
                ["freeze-end", freeze_id] => self.freeze_end(freeze_id, &mut output).await?,
                ["debug"] => self.debug(&mut output).await?,
                _ => {
                    writeln!(output, "unrecognized command: {line}").ok();
                }
            }
        }
        Ok(())
    }

    async fn getversion(&mut self, output: &mut impl Write) -> CResult<()> {
        match self.conn.call(&Request::Disk(DiskRequest::GetVersion)).await? {
            Response::Disk(DiskResponse::Version(v)) => {
                writeln!(output, "version: epoch={} counter={}", v.epoch, v.counter).ok();
            }
            other => report_unexpected(output, other),
        }
        Ok(())
    }

    async fn read_file(&mut self, file: &str, output: &mut impl Write) -> CResult<()> {
        let file: i32 = file.parse().map_err(|_| Error::Parse(format!("bad file id {file}")))?;
        match self.conn.call(&Request::Disk(DiskRequest::GetFile { file })).await? {
            Response::Disk(DiskResponse::Bytes(bytes)) => {
                writeln!(output, "{} bytes: {}", bytes.len(), hex::encode(&bytes)).ok();
            }
            other => report_unexpected(output, other),
        }
        Ok(())
    }

    /// Drives a whole write transaction (`Begin` -> `Write` -> `Commit`)
    /// against the connected server, bumping only the counter half of its
    /// current label.
    async fn write_file(&mut self, file: &str, pos: &str, hex_data: &str, output: &mut impl Write) -> CResult<()> {
        let file: i32 = file.parse().map_err(|_| Error::Parse(format!("bad file id {file}")))?;
        let pos: u64 = pos.parse().map_err(|_| Error::Parse(format!("bad position {pos}")))?;
        let data = hex::decode(hex_data).map_err(|e| Error::Parse(e.to_string()))?;

        let current = match self.conn.call(&Request::Disk(DiskRequest::GetVersion)).await? {
            Response::Disk(DiskResponse::Version(v)) => v,
            other => {
                report_unexpected(output, other);
                return Ok(());
            }
        };

        let tid = (current.epoch as u32, 1u32);
        self.conn.call(&Request::Disk(DiskRequest::Begin { tid, read_only: false })).await?;
        self.conn.call(&Request::Disk(DiskRequest::Write { tid, file, pos, data })).await?;
        let new_version = VersionWire { epoch: current.epoch, counter: current.counter + 1 };
        match self.conn.call(&Request::Disk(DiskRequest::Commit { tid, version: new_version })).await? {
            Response::Disk(DiskResponse::Ack) => {
                writeln!(output, "committed at epoch={} counter={}", new_version.epoch, new_version.counter).ok();
            }
            other => report_unexpected(output, other),
        }
        Ok(())
    }

    async fn freeze_begin(&mut self, output: &mut impl Write) -> CResult<()> {
        let req = DiskRequest::FreezeBegin { need_sync: true, timeout_secs: 60, read_write: true };
        match self.conn.call(&Request::Disk(req)).await? {
            Response::Disk(DiskResponse::Frozen { freeze_id, version, db_path }) => {
                writeln!(
                    output,
                    "freeze_id={freeze_id} version=({},{}) db_path={db_path}",
                    version.epoch, version.counter
                )
                .ok();
            }
            other => report_unexpected(output, other),
        }
        Ok(())
    }

    async fn freeze_install(
        &mut self,
        freeze_id: &str,
        old_epoch: &str,
        old_counter: &str,
        new_epoch: &str,
        new_counter: &str,
        output: &mut impl Write,
    ) -> CResult<()> {
        let freeze_id: u64 = freeze_id.parse().map_err(|_| Error::Parse("bad freeze id".into()))?;
        let old_version = VersionWire {
            epoch: old_epoch.parse().map_err(|_| Error::Parse("bad old epoch".into()))?,
            counter: old_counter.parse().map_err(|_| Error::Parse("bad old counter".into()))?,
        };
        let new_version = VersionWire {
            epoch: new_epoch.parse().map_err(|_| Error::Parse("bad new epoch".into()))?,
            counter: new_counter.parse().map_err(|_| Error::Parse("bad new counter".into()))?,
        };
        let req = DiskRequest::FreezeInstall {
            freeze_id,
            old_version,
            new_version,
            new_suffix: format!(".CONV.{freeze_id}"),
            backup_suffix: Some(".OLD".to_string()),
        };
        match self.conn.call(&Request::Disk(req)).await? {
            Response::Disk(DiskResponse::Ack) => {
                writeln!(output, "installed").ok();
            }
            other => report_unexpected(output, other),
        }
        Ok(())
    }

    async fn freeze_end(&mut self, freeze_id: &str, output: &mut impl Write) -> CResult<()> {
        let freeze_id: u64 = freeze_id.parse().map_err(|_| Error::Parse("bad freeze id".into()))?;
        match self.conn.call(&Request::Disk(DiskRequest::FreezeEnd { freeze_id })).await? {
            Response::Disk(DiskResponse::Ack) => {
                writeln!(output, "ended").ok();
            }
            other => report_unexpected(output, other),
        }
        Ok(())
    }

    async fn debug(&mut self, output: &mut impl Write) -> CResult<()> {
        match self.conn.call(&Request::Vote(VoteRequest::Debug)).await? {
            Response::Vote(VoteResponse::Debug(dump)) => {
                writeln!(
                    output,
                    "server={} sync_site={} claim={:?} version=({},{})",
                    dump.server_id, dump.is_sync_site, dump.sync_site_claim, dump.version.epoch, dump.version.counter
                )
                .ok();
                for peer in &dump.peers {
                    writeln!(
                        output,
                        "  peer={} up={} current_db={} beacon_since_down={} last_vote_yes={}",
                        peer.server_id, peer.up, peer.current_db, peer.beacon_since_down, peer.last_vote_yes
                    )
                    .ok();
                }
            }
            other => report_unexpected(output, other),
        }
        Ok(())
    }
}

fn report_unexpected(output: &mut impl Write, response: Response) {
    match response {
        Response::Disk(DiskResponse::Error { kind, message }) => {
            writeln!(output, "error: {kind}: {message}").ok();
        }
        other => {
            writeln!(output, "unexpected response: {other:?}").ok();
        }
    }
}
