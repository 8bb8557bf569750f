use std::path::Path;

use chrono::{DateTime, Local, SecondsFormat};
use tracing::{debug, info, instrument, warn};

use crate::command::Command;
use crate::constant::sqlstate;
use crate::error::{Error, Result};
use crate::prepared::StatementCache;
use crate::proc::{ProcessRecord, read_process_table};
use crate::sync::conn::Conn;
use crate::sync::queue::CommandQueue;
use crate::sync::session::{Connector, Session};
use crate::sync::stream::Socket;
use crate::sync::transaction::Transaction;

/// Tables written by [`record_snapshot`]
pub const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS pid_sets (
    set_id serial PRIMARY KEY,
    pgserver_time timestamp with time zone DEFAULT CURRENT_TIMESTAMP,
    node_time timestamp with time zone,
    nodename text
);
CREATE TABLE IF NOT EXISTS pids (
    set_id integer REFERENCES pid_sets,
    pid integer, comm text, cmdline text, state text,
    ppid integer, pgrp integer, session integer, tty_nr integer, tpgid integer,
    flags integer, minflt integer, cminflt integer, majflt integer, cmajflt integer,
    utime integer, stime integer, cutime integer, priority integer, nice integer,
    num_threads integer
);";

/// The process table of this host at one instant
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub nodename: String,
    pub node_time: DateTime<Local>,
    pub records: Vec<ProcessRecord>,
}

impl Snapshot {
    #[instrument(skip_all, fields(root = %proc_root.display()))]
    pub fn capture(proc_root: &Path) -> Result<Self> {
        let nodename = hostname::get()?.to_string_lossy().into_owned();
        let node_time = Local::now();
        let records = read_process_table(proc_root)?;
        debug!(processes = records.len(), "captured process table");
        Ok(Self {
            nodename,
            node_time,
            records,
        })
    }
}

/// What [`record_snapshot`] stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotSummary {
    pub set_id: u64,
    pub rows: usize,
}

fn set_command(snapshot: &Snapshot) -> Result<Command> {
    let mut command = Command::new("pid_sets_insert").table("pid_sets");
    command
        .add_column("nodename", snapshot.nodename.as_str())?
        .add_column(
            "node_time",
            snapshot
                .node_time
                .to_rfc3339_opts(SecondsFormat::Micros, false),
        )?;
    Ok(command)
}

fn process_command(set_id: u64, record: &ProcessRecord) -> Result<Command> {
    let mut command = Command::new("pid_insert").table("pids");
    command
        .add_column("set_id", set_id)?
        .add_column("cmdline", record.cmdline.as_str())?
        .add_column("pid", record.pid)?
        .add_column("comm", record.comm.as_str())?
        .add_column("state", record.state)?
        .add_column("ppid", record.ppid)?
        .add_column("pgrp", record.pgrp)?
        .add_column("session", record.session)?
        .add_column("tty_nr", record.tty_nr)?
        .add_column("tpgid", record.tpgid)?
        // the column is a signed integer; keep the bit pattern
        .add_column("flags", record.flags.cast_signed())?
        .add_column("minflt", record.minflt)?
        .add_column("cminflt", record.cminflt)?
        .add_column("majflt", record.majflt)?
        .add_column("cmajflt", record.cmajflt)?
        .add_column("utime", record.utime)?
        .add_column("stime", record.stime)?
        .add_column("cutime", record.cutime)?
        .add_column("priority", record.priority)?
        .add_column("nice", record.nice)?
        .add_column("num_threads", record.num_threads)?;
    Ok(command)
}

/// Store one snapshot as a `pid_sets` row plus one `pids` row per process, in a
/// single transaction
#[instrument(skip_all, fields(node = %snapshot.nodename, processes = snapshot.records.len()))]
pub fn record_snapshot<C: Connector>(
    session: &mut Session<C>,
    snapshot: &Snapshot,
) -> Result<SnapshotSummary> {
    session.connect()?;
    let (conn, cache) = session.parts()?;

    let tx = Transaction::begin(conn)?;
    let set_id = match write_rows(conn, cache, snapshot) {
        Ok(set_id) => set_id,
        Err(e) => {
            if !conn.is_broken()
                && let Err(rollback) = tx.rollback(conn).and_then(|_| conn.settle())
            {
                warn!(error = %rollback, "rollback after failed snapshot also failed");
            }
            return Err(e);
        }
    };

    let report = tx.commit(conn)?;
    if !report.is_clean() {
        let skipped = report
            .failures
            .iter()
            .filter(|e| e.code == sqlstate::IN_FAILED_SQL_TRANSACTION)
            .count();
        warn!(
            failures = report.failures.len() - skipped,
            skipped, "snapshot rows failed"
        );
    }
    let done = conn.drain()?;
    if done.last_tag.as_deref() == Some("ROLLBACK") {
        return Err(Error::RolledBack);
    }

    let summary = SnapshotSummary {
        set_id,
        rows: snapshot.records.len(),
    };
    info!(set_id, rows = summary.rows, "snapshot recorded");
    Ok(summary)
}

fn write_rows<S: Socket>(
    conn: &mut Conn<S>,
    cache: &mut StatementCache,
    snapshot: &Snapshot,
) -> Result<u64> {
    let set = set_command(snapshot)?;
    set.dispatch(conn, cache)?;
    set.fetch_result(conn)?;
    let set_id = conn.lastval()?;
    debug!(set_id, "created pid set");

    let queue = CommandQueue::new();
    for record in &snapshot.records {
        queue.enqueue(process_command(set_id, record)?);
    }
    queue.run(conn, cache)?;
    Ok(set_id)
}
