use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::sync::Weak;
use std::sync::atomic::{AtomicU64, Ordering};

use postgres_protocol::message::backend;
use tracing::{debug, instrument, trace, warn};

use crate::buffer::{BufferSet, READ_CHUNK};
use crate::constant::{TransactionState, TransactionStatus, sqlstate};
use crate::error::{Error, Result};
use crate::opts::{CommandErrorPolicy, Opts};
use crate::poll::{Backoff, RetryPolicy};
use crate::protocol::connection::{Startup, StartupStep};
use crate::protocol::frontend;
use crate::protocol::response::{
    BackendEvent, DrainReport, PgResult, ResultAssembler, ServerError,
};
use crate::sync::stream::{Socket, Stream};

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Outcome of one attempt to write buffered output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// The output buffer is empty
    Done,
    /// The socket would block; call again later
    Pending,
}

/// Outcome of asking for the next result without blocking
#[derive(Debug)]
pub enum ResultPoll {
    Ready(PgResult),
    /// Results are still on their way
    Busy,
    /// Nothing was sent that has not been answered
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Prepare,
    Execute,
    Query,
}

/// A request sent to the server whose ReadyForQuery has not arrived yet
#[derive(Debug)]
struct InFlight {
    kind: RequestKind,
    /// Prepared statement the request refers to
    statement: Option<String>,
    answered: bool,
}

/// A non-blocking PostgreSQL connection
///
/// Every request is written into an output buffer and pushed to the socket as far
/// as it accepts without blocking. Answers are collected by [`Conn::consume_input`]
/// and handed out in send order by [`Conn::get_result`]. Each result must be given
/// back to [`Conn::release`], which records it in the drain report.
pub struct Conn<S: Socket = Stream> {
    stream: S,
    buffer_set: BufferSet,
    assembler: ResultAssembler,
    in_flight: VecDeque<InFlight>,
    ready: VecDeque<PgResult>,
    report: DrainReport,
    serial: u64,
    server_params: Vec<(String, String)>,
    process_id: i32,
    secret_key: i32,
    transaction_status: TransactionStatus,
    pub(crate) tx_state: TransactionState,
    /// Alive while the [`Transaction`](crate::sync::Transaction) that opened `tx_state` exists
    pub(crate) tx_token: Weak<()>,
    invalidated_statements: Vec<String>,
    retry: RetryPolicy,
    on_command_error: CommandErrorPolicy,
    is_broken: bool,
}

impl Conn<Stream> {
    /// Connect over TLS and authenticate
    pub fn connect(opts: &Opts) -> Result<Self> {
        opts.validate()?;
        let stream = Stream::connect(opts)?;
        Self::new_with_stream(stream, opts)
    }
}

impl<S: Socket> Conn<S> {
    /// Run the startup exchange on an established socket
    ///
    /// The socket is switched to non-blocking mode once the server is ready.
    #[instrument(skip_all)]
    pub fn new_with_stream(stream: S, opts: &Opts) -> Result<Self> {
        let mut conn = Self {
            stream,
            buffer_set: BufferSet::new(),
            assembler: ResultAssembler::new(),
            in_flight: VecDeque::new(),
            ready: VecDeque::new(),
            report: DrainReport::default(),
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            server_params: Vec::new(),
            process_id: 0,
            secret_key: 0,
            transaction_status: TransactionStatus::Idle,
            tx_state: TransactionState::Idle,
            tx_token: Weak::new(),
            invalidated_statements: Vec::new(),
            retry: opts.retry,
            on_command_error: opts.on_command_error,
            is_broken: false,
        };

        let startup_policy = RetryPolicy {
            timeout: opts.connect_timeout,
            ..opts.retry
        };
        let mut backoff = startup_policy.backoff("startup");
        let mut startup = Startup::new(opts);
        startup.start(conn.buffer_set.write_buffer_mut())?;

        let info = loop {
            conn.write_all_polling(&mut backoff)?;
            let message = conn.read_message_polling(&mut backoff)?;
            match startup.drive(message, conn.buffer_set.write_buffer_mut())? {
                StartupStep::Continue => {}
                StartupStep::Done(info) => break info,
            }
        };

        conn.server_params = info.parameters;
        conn.process_id = info.process_id;
        conn.secret_key = info.secret_key;
        conn.transaction_status = info.transaction_status;

        if let Err(e) = conn.stream.set_nonblocking(true) {
            warn!(error = %e, "failed to switch the connection to non-blocking mode");
        }
        debug!(serial = conn.serial, backend_pid = conn.process_id, "connected");
        Ok(conn)
    }

    fn write_all_polling(&mut self, backoff: &mut Backoff) -> Result<()> {
        while self.flush_inner()? == Flush::Pending {
            backoff.wait()?;
        }
        Ok(())
    }

    fn read_message_polling(&mut self, backoff: &mut Backoff) -> Result<backend::Message> {
        loop {
            if let Some(message) = backend::Message::parse(&mut self.buffer_set.read_buffer)? {
                return Ok(message);
            }
            if self.read_some()? == 0 {
                backoff.wait()?;
            }
        }
    }

    /// Process-unique number of this connection
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn server_params(&self) -> &[(String, String)] {
        &self.server_params
    }

    /// Backend process id, as reported in BackendKeyData
    pub fn process_id(&self) -> i32 {
        self.process_id
    }

    pub fn secret_key(&self) -> i32 {
        self.secret_key
    }

    /// Transaction status from the last ReadyForQuery
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    pub fn transaction_state(&self) -> TransactionState {
        self.tx_state
    }

    pub fn is_broken(&self) -> bool {
        self.is_broken
    }

    pub fn on_command_error(&self) -> CommandErrorPolicy {
        self.on_command_error
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Whether unwritten output is buffered
    pub fn pending_output(&self) -> bool {
        self.buffer_set.has_pending_output()
    }

    /// Number of results that were not released yet, including those still on the wire
    pub fn outstanding(&self) -> usize {
        self.ready.len() + self.in_flight.iter().filter(|r| !r.answered).count()
    }

    /// Whether asking for a result now would have to wait for the server
    pub fn is_busy(&self) -> bool {
        self.ready.is_empty() && !self.in_flight.is_empty()
    }

    /// Nothing buffered, nothing on the wire, nothing unreleased
    pub fn is_idle(&self) -> bool {
        self.ready.is_empty() && self.in_flight.is_empty() && !self.pending_output()
    }

    /// First failure released since the last drain
    pub fn first_failure(&self) -> Option<&ServerError> {
        self.report.failures.first()
    }

    /// Results released since the last drain
    pub fn report(&self) -> &DrainReport {
        &self.report
    }

    /// Prepared statements the server reported missing since the last call
    pub(crate) fn take_invalidated_statements(&mut self) -> Vec<String> {
        std::mem::take(&mut self.invalidated_statements)
    }

    /// Whether the last ReadyForQuery reported an open transaction and nothing
    /// sent since could have changed that
    pub(crate) fn server_in_transaction(&self) -> bool {
        self.in_flight.is_empty() && self.transaction_status.in_transaction()
    }

    /// Give up on the connection; its server-side state is unknown
    pub(crate) fn mark_broken(&mut self) {
        if !self.is_broken {
            warn!(serial = self.serial, "connection left in an unknown state, marking broken");
        }
        self.is_broken = true;
    }

    fn check<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result
            && e.is_connection_broken()
        {
            self.is_broken = true;
        }
        result
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.is_broken {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    // ─── Sending ────────────────────────────────────────────────────────

    /// Send a simple query without waiting for its result
    pub fn send_query(&mut self, sql: &str) -> Result<()> {
        self.ensure_usable()?;
        frontend::write_query(self.buffer_set.write_buffer_mut(), sql)?;
        self.sent(RequestKind::Query, None)
    }

    /// Send Parse for a named statement without waiting for its result
    pub fn send_prepare(&mut self, name: &str, sql: &str, param_count: usize) -> Result<()> {
        self.ensure_usable()?;
        frontend::write_prepare(self.buffer_set.write_buffer_mut(), name, sql, param_count)?;
        self.sent(RequestKind::Prepare, Some(name))
    }

    /// Send Bind + Execute for a prepared statement without waiting for its result
    pub fn send_query_prepared<'a, I>(&mut self, name: &str, params: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.ensure_usable()?;
        frontend::write_execute(self.buffer_set.write_buffer_mut(), name, params)?;
        self.sent(RequestKind::Execute, Some(name))
    }

    fn sent(&mut self, kind: RequestKind, statement: Option<&str>) -> Result<()> {
        trace!(?kind, in_flight = self.in_flight.len(), "sent");
        self.in_flight.push_back(InFlight {
            kind,
            statement: statement.map(str::to_string),
            answered: false,
        });
        self.flush()?;
        Ok(())
    }

    /// Write as much buffered output as the socket accepts without blocking
    pub fn flush(&mut self) -> Result<Flush> {
        let result = self.flush_inner();
        self.check(result)
    }

    fn flush_inner(&mut self) -> Result<Flush> {
        while self.buffer_set.has_pending_output() {
            match self.stream.write(self.buffer_set.pending_output()) {
                Ok(0) => return Err(Error::IoError(ErrorKind::WriteZero.into())),
                Ok(n) => self.buffer_set.advance_output(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(Flush::Pending),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        match self.stream.flush() {
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(Flush::Pending),
            Err(e) => Err(e.into()),
            Ok(()) => Ok(Flush::Done),
        }
    }

    /// Flush until the output buffer is empty, polling with backoff
    ///
    /// The timeout bounds each stretch without progress, not the whole flush.
    /// Returns the number of times it had to wait.
    #[instrument(skip_all)]
    pub fn flush_until_done(&mut self) -> Result<u32> {
        let mut backoff = self.retry.backoff("flush");
        let mut waits = 0;
        let mut pending = self.buffer_set.pending_output().len();
        while self.flush()? == Flush::Pending {
            let left = self.buffer_set.pending_output().len();
            if left < pending {
                backoff.reset();
                pending = left;
            }
            let result = backoff.wait();
            self.check(result)?;
            waits += 1;
        }
        Ok(waits)
    }

    // ─── Receiving ──────────────────────────────────────────────────────

    /// Read whatever the socket has without blocking and assemble complete results
    pub fn consume_input(&mut self) -> Result<()> {
        let result = self.consume_input_inner();
        self.check(result)
    }

    fn consume_input_inner(&mut self) -> Result<()> {
        while self.read_some()? > 0 {}
        self.process_messages()
    }

    /// One non-blocking read into the read buffer. `Ok(0)` means it would block.
    fn read_some(&mut self) -> Result<usize> {
        let buffer = &mut self.buffer_set.read_buffer;
        let start = buffer.len();
        buffer.resize(start + READ_CHUNK, 0);
        loop {
            match self.stream.read(&mut buffer[start..]) {
                Ok(0) => {
                    buffer.truncate(start);
                    return Err(Error::ConnectionClosed);
                }
                Ok(n) => {
                    buffer.truncate(start + n);
                    return Ok(n);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    buffer.truncate(start);
                    return Ok(0);
                }
                Err(e) => {
                    buffer.truncate(start);
                    return Err(e.into());
                }
            }
        }
    }

    fn process_messages(&mut self) -> Result<()> {
        while let Some(message) = backend::Message::parse(&mut self.buffer_set.read_buffer)? {
            match self.assembler.feed(message)? {
                BackendEvent::Result(result) => {
                    let Some(request) = self.in_flight.front_mut() else {
                        return Err(Error::InvalidMessage(
                            "Result received with no request in flight".to_string(),
                        ));
                    };
                    request.answered = true;
                    if let (Some(err), Some(statement)) = (&result.error, &request.statement)
                        && err.code == sqlstate::INVALID_SQL_STATEMENT_NAME
                    {
                        self.invalidated_statements.push(statement.clone());
                    }
                    self.ready.push_back(result);
                }
                BackendEvent::Ready(status) => {
                    let Some(request) = self.in_flight.pop_front() else {
                        return Err(Error::InvalidMessage(
                            "Unsolicited ReadyForQuery".to_string(),
                        ));
                    };
                    trace!(kind = ?request.kind, ?status, "request complete");
                    self.transaction_status = status;
                }
                BackendEvent::Notice(notice) => {
                    warn!(code = %notice.code, "{}", notice.message);
                }
                BackendEvent::Parameter(name, value) => {
                    match self.server_params.iter_mut().find(|(n, _)| *n == name) {
                        Some(param) => param.1 = value,
                        None => self.server_params.push((name, value)),
                    }
                }
                BackendEvent::BackendKey { .. } | BackendEvent::None => {}
            }
        }
        Ok(())
    }

    /// Next result in send order, without reading from the socket
    pub fn get_result(&mut self) -> ResultPoll {
        if let Some(result) = self.ready.pop_front() {
            ResultPoll::Ready(result)
        } else if self.in_flight.is_empty() {
            ResultPoll::Idle
        } else {
            ResultPoll::Busy
        }
    }

    /// Give a fetched result back; failures are logged and kept for the next drain
    pub fn release(&mut self, result: PgResult) {
        if let Some(err) = &result.error {
            warn!(code = %err.code, detail = ?err.detail, "command failed: {}", err.message);
        }
        self.report.record(&result);
    }

    /// Release one result if it is ready. Returns whether one was released.
    pub fn release_ready(&mut self) -> bool {
        match self.ready.pop_front() {
            Some(result) => {
                self.release(result);
                true
            }
            None => false,
        }
    }

    /// Flush, then read and release every outstanding result
    #[instrument(skip_all)]
    pub fn settle(&mut self) -> Result<()> {
        self.flush_until_done()?;
        let mut backoff = self.retry.backoff("drain");
        loop {
            self.consume_input()?;
            let mut progressed = false;
            while self.release_ready() {
                progressed = true;
            }
            if self.in_flight.is_empty() {
                return Ok(());
            }
            if progressed {
                backoff.reset();
            } else {
                let result = backoff.wait();
                self.check(result)?;
            }
        }
    }

    /// Settle and hand out everything released since the previous drain
    pub fn drain(&mut self) -> Result<DrainReport> {
        self.settle()?;
        Ok(std::mem::take(&mut self.report))
    }

    /// Wait for the answer of the only request in flight
    ///
    /// Keeps the first failure, otherwise the last result.
    fn wait_own_result(&mut self) -> Result<PgResult> {
        self.flush_until_done()?;
        let mut backoff = self.retry.backoff("result");
        let mut own: Option<PgResult> = None;
        loop {
            self.consume_input()?;
            while let Some(result) = self.ready.pop_front() {
                if own.as_ref().is_none_or(PgResult::is_ok) {
                    own = Some(result);
                }
            }
            if self.in_flight.is_empty() {
                return own.ok_or_else(|| {
                    Error::InvalidMessage("Request completed without a result".to_string())
                });
            }
            let result = backoff.wait();
            self.check(result)?;
        }
    }

    // ─── Round trips ────────────────────────────────────────────────────

    /// Run a simple query after settling everything sent before it
    #[instrument(skip_all)]
    pub fn query(&mut self, sql: &str) -> Result<PgResult> {
        self.settle()?;
        self.send_query(sql)?;
        self.wait_own_result()?.into_result()
    }

    /// Prepare a named statement after settling everything sent before it
    ///
    /// A server-side failure is returned as a failed result, not as `Err`.
    #[instrument(skip_all, fields(name = %name))]
    pub fn prepare(&mut self, name: &str, sql: &str, param_count: usize) -> Result<PgResult> {
        self.settle()?;
        self.send_prepare(name, sql, param_count)?;
        self.wait_own_result()
    }

    /// Value of the sequence most recently advanced in this session
    pub fn lastval(&mut self) -> Result<u64> {
        let result = self.query("SELECT lastval()")?;
        let value = result
            .get(0, 0)
            .ok_or_else(|| Error::InvalidMessage("lastval() returned no value".to_string()))?;
        value
            .parse()
            .map_err(|e| Error::InvalidMessage(format!("lastval() returned {:?}: {}", value, e)))
    }

    /// Empty-query round trip
    pub fn ping(&mut self) -> Result<()> {
        self.query("").map(drop)
    }

    /// Send Terminate and drop the connection
    pub fn close(mut self) -> Result<()> {
        self.in_flight.clear();
        frontend::write_terminate(self.buffer_set.write_buffer_mut());
        self.flush_until_done()?;
        Ok(())
    }
}

impl<S: Socket> std::fmt::Debug for Conn<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("serial", &self.serial)
            .field("in_flight", &self.in_flight.len())
            .field("ready", &self.ready.len())
            .field("transaction_status", &self.transaction_status)
            .field("is_broken", &self.is_broken)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::command::Command;
    use crate::prepared::StatementCache;
    use crate::sync::mock::{MockServer, MockSocket, connect, test_opts};

    #[test]
    fn blocking_socket_is_only_a_warning() {
        let server = MockServer::shared();
        server.borrow_mut().refuse_nonblocking = true;
        let mut conn = connect(&server);
        let mut cache = StatementCache::new();

        let mut command = Command::new("v_insert").table("things");
        command.add_column("v", "1").unwrap();
        command.dispatch(&mut conn, &mut cache).unwrap();
        let report = conn.drain().unwrap();
        assert!(report.is_clean());
        assert!(!conn.is_broken());
        assert_eq!(server.borrow().committed_in("things").len(), 1);
    }

    #[test]
    fn slow_flush_is_not_a_timeout_while_output_moves() {
        let server = MockServer::shared();
        let mut opts = test_opts(CommandErrorPolicy::Log);
        opts.retry.timeout = Duration::from_millis(20);
        let mut conn = Conn::new_with_stream(MockSocket::new(&server), &opts).unwrap();
        {
            let mut server = server.borrow_mut();
            server.max_write_chunk = 1;
            server.stall_every = 2;
        }

        // one byte per flush, well over the timeout in total
        let sql = format!("SELECT '{}'", "x".repeat(5000));
        conn.send_query(&sql).unwrap();
        assert!(conn.pending_output());
        let waits = conn.flush_until_done().unwrap();
        assert!(waits > 1000, "{waits}");
        assert!(!conn.pending_output());
        assert!(!conn.is_broken());
    }
}
