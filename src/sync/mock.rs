//! Scripted PostgreSQL backend behind a non-blocking fake socket.
//!
//! The server answers each frontend message as soon as it is complete in its
//! input, so pipelining, partial writes and write stalls can be exercised
//! without a database.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::io::{self, ErrorKind, Read, Write};
use std::rc::Rc;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};

use crate::constant::sqlstate;
use crate::error::Result;
use crate::opts::{CommandErrorPolicy, Opts};
use crate::poll::RetryPolicy;
use crate::sync::conn::Conn;
use crate::sync::session::Connector;
use crate::sync::stream::Socket;

/// A row the server accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockRow {
    pub table: String,
    pub values: Vec<(String, String)>,
}

impl MockRow {
    pub fn get(&self, column: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, v)| v.as_str())
    }
}

struct Portal {
    statement: String,
    params: Vec<String>,
}

#[derive(Default)]
pub struct MockServer {
    inbox: BytesMut,
    outbox: BytesMut,
    started: bool,
    statements: HashMap<String, String>,
    portal: Option<Portal>,
    skipping: bool,
    in_transaction: bool,
    transaction_failed: bool,
    sequence: u64,
    pending_rows: Vec<MockRow>,
    write_calls: usize,

    /// Statement names whose Parse fails
    pub fail_prepare: HashSet<String>,
    /// Any bound parameter equal to one of these makes Execute fail
    pub fail_values: HashSet<String>,
    /// Every n-th write call returns WouldBlock (0 = never)
    pub stall_every: usize,
    /// Upper bound of bytes accepted by one write call (0 = unbounded)
    pub max_write_chunk: usize,
    /// Upper bound of bytes returned by one read call (0 = unbounded)
    pub read_chunk: usize,
    /// Refuse all writes
    pub write_blocked: bool,
    pub closed: bool,
    /// `set_nonblocking` fails
    pub refuse_nonblocking: bool,

    /// Frontend messages in arrival order, e.g. `Parse pid_insert`, `Query BEGIN`
    pub log: Vec<String>,
    pub parse_count: usize,
    pub committed: Vec<MockRow>,
    /// Server output the client had not read yet when COMMIT arrived
    pub unread_at_commit: Option<usize>,
    pub connects: usize,
}

impl MockServer {
    pub fn shared() -> Rc<RefCell<MockServer>> {
        Rc::new(RefCell::new(MockServer::default()))
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.log.iter().filter(|m| m.starts_with(prefix)).count()
    }

    pub fn committed_in(&self, table: &str) -> Vec<&MockRow> {
        self.committed.iter().filter(|r| r.table == table).collect()
    }

    /// Drop every prepared statement, as `DEALLOCATE ALL` would
    pub fn forget_statements(&mut self) {
        self.statements.clear();
    }

    fn receive(&mut self, bytes: &[u8]) {
        self.inbox.extend_from_slice(bytes);
        loop {
            if !self.started {
                if self.inbox.len() < 4 {
                    return;
                }
                let len = length(&self.inbox[..4]);
                if self.inbox.len() < len {
                    return;
                }
                let body = self.inbox.split_to(len);
                self.startup(&body[4..]);
                continue;
            }
            if self.inbox.len() < 5 {
                return;
            }
            let tag = self.inbox[0];
            let len = length(&self.inbox[1..5]);
            if self.inbox.len() < len + 1 {
                return;
            }
            let message = self.inbox.split_to(len + 1);
            self.handle(tag, &message[5..]);
        }
    }

    fn startup(&mut self, mut body: &[u8]) {
        let code = body.get_i32();
        if code == 80877103 {
            // SSLRequest
            self.outbox.put_u8(b'N');
            return;
        }
        let mut user = String::new();
        while body.first().is_some_and(|b| *b != 0) {
            let key = cstr(&mut body);
            let value = cstr(&mut body);
            if key == "user" {
                user = value;
            }
        }
        self.log.push(format!("Startup {}", user));
        self.started = true;
        self.connects += 1;
        // whatever the previous session left open is rolled back
        self.statements.clear();
        self.portal = None;
        self.skipping = false;
        self.in_transaction = false;
        self.transaction_failed = false;
        self.pending_rows.clear();

        self.send(b'R', &0i32.to_be_bytes());
        self.send(b'S', b"server_version\x0016.2\0");
        self.send(b'S', b"client_encoding\0UTF8\0");
        let mut key = Vec::new();
        key.extend_from_slice(&4242i32.to_be_bytes());
        key.extend_from_slice(&7i32.to_be_bytes());
        self.send(b'K', &key);
        self.ready();
    }

    fn handle(&mut self, tag: u8, mut body: &[u8]) {
        if self.skipping && tag != b'S' {
            return;
        }
        match tag {
            b'P' => {
                let name = cstr(&mut body);
                let sql = cstr(&mut body);
                self.log.push(format!("Parse {}", name));
                self.parse_count += 1;
                if self.fail_prepare.contains(&name) {
                    let message = format!("relation for \"{}\" does not exist", name);
                    self.extended_error("42P01", &message);
                } else if !self.transaction_ok() {
                    self.aborted();
                } else {
                    self.statements.insert(name, sql);
                    self.send(b'1', &[]);
                }
            }
            b'B' => {
                let _portal = cstr(&mut body);
                let statement = cstr(&mut body);
                self.log.push(format!("Bind {}", statement));
                let formats = body.get_i16();
                body.advance(formats as usize * 2);
                let count = body.get_i16();
                let mut params = Vec::new();
                for _ in 0..count {
                    let len = body.get_i32();
                    let value = String::from_utf8_lossy(&body[..len as usize]).into_owned();
                    body.advance(len as usize);
                    params.push(value);
                }
                if !self.statements.contains_key(&statement) {
                    self.extended_error(
                        "26000",
                        &format!("prepared statement \"{}\" does not exist", statement),
                    );
                } else if !self.transaction_ok() {
                    self.aborted();
                } else {
                    self.portal = Some(Portal { statement, params });
                    self.send(b'2', &[]);
                }
            }
            b'E' => {
                self.log.push("Execute".to_string());
                self.execute();
            }
            b'S' => {
                self.log.push("Sync".to_string());
                self.skipping = false;
                self.portal = None;
                self.ready();
            }
            b'Q' => {
                let sql = cstr(&mut body);
                self.log.push(format!("Query {}", sql));
                self.simple_query(&sql);
                self.ready();
            }
            b'X' => {
                self.log.push("Terminate".to_string());
                self.closed = true;
            }
            other => panic!("mock server got unexpected message {:?}", other as char),
        }
    }

    fn execute(&mut self) {
        let Some(portal) = self.portal.take() else {
            return;
        };
        let sql = self.statements.get(&portal.statement).cloned().unwrap_or_default();
        if portal.params.iter().any(|p| self.fail_values.contains(p)) {
            self.extended_error("23502", "null value in column violates not-null constraint");
            return;
        }
        if let Some(rest) = sql.strip_prefix("INSERT INTO ") {
            let table = rest.split(' ').next().unwrap_or_default().to_string();
            let columns = between(rest, '(', ')');
            let mut values: Vec<(String, String)> = columns
                .split(", ")
                .map(str::to_string)
                .zip(portal.params)
                .collect();
            if table == "pid_sets" {
                self.sequence += 1;
                values.push(("set_id".to_string(), self.sequence.to_string()));
            }
            self.pending_rows.push(MockRow { table, values });
            self.complete("INSERT 0 1");
        } else if sql.starts_with("UPDATE ") {
            self.complete("UPDATE 1");
        } else {
            self.complete("SELECT 0");
        }
        if !self.in_transaction {
            self.committed.append(&mut self.pending_rows);
        }
    }

    fn simple_query(&mut self, sql: &str) {
        match sql {
            "" => self.send(b'I', &[]),
            "BEGIN" => {
                self.in_transaction = true;
                self.complete("BEGIN");
            }
            "COMMIT" => {
                self.unread_at_commit = Some(self.outbox.len());
                if self.transaction_failed {
                    self.pending_rows.clear();
                    self.complete("ROLLBACK");
                } else {
                    self.committed.append(&mut self.pending_rows);
                    self.complete("COMMIT");
                }
                self.in_transaction = false;
                self.transaction_failed = false;
            }
            "ROLLBACK" => {
                self.pending_rows.clear();
                self.in_transaction = false;
                self.transaction_failed = false;
                self.complete("ROLLBACK");
            }
            _ if !self.transaction_ok() => self.aborted(),
            "SELECT lastval()" => {
                let mut desc = Vec::new();
                desc.extend_from_slice(&1i16.to_be_bytes());
                desc.extend_from_slice(b"lastval\0");
                desc.extend_from_slice(&0i32.to_be_bytes());
                desc.extend_from_slice(&0i16.to_be_bytes());
                desc.extend_from_slice(&20u32.to_be_bytes());
                desc.extend_from_slice(&8i16.to_be_bytes());
                desc.extend_from_slice(&(-1i32).to_be_bytes());
                desc.extend_from_slice(&0i16.to_be_bytes());
                self.send(b'T', &desc);
                let value = self.sequence.to_string();
                let mut row = Vec::new();
                row.extend_from_slice(&1i16.to_be_bytes());
                row.extend_from_slice(&(value.len() as i32).to_be_bytes());
                row.extend_from_slice(value.as_bytes());
                self.send(b'D', &row);
                self.complete("SELECT 1");
            }
            _ => self.error("42601", "syntax error"),
        }
    }

    fn transaction_ok(&self) -> bool {
        !self.transaction_failed
    }

    fn aborted(&mut self) {
        self.extended_error(
            sqlstate::IN_FAILED_SQL_TRANSACTION,
            "current transaction is aborted, commands ignored until end of transaction block",
        );
    }

    fn extended_error(&mut self, code: &str, message: &str) {
        self.error(code, message);
        self.skipping = true;
        self.portal = None;
    }

    fn error(&mut self, code: &str, message: &str) {
        if self.in_transaction {
            self.transaction_failed = true;
        }
        let body = format!("SERROR\0VERROR\0C{}\0M{}\0\0", code, message);
        self.send(b'E', body.as_bytes());
    }

    fn complete(&mut self, tag: &str) {
        let body = format!("{}\0", tag);
        self.send(b'C', body.as_bytes());
    }

    fn ready(&mut self) {
        let status = match (self.in_transaction, self.transaction_failed) {
            (false, _) => b'I',
            (true, false) => b'T',
            (true, true) => b'E',
        };
        self.send(b'Z', &[status]);
    }

    fn send(&mut self, tag: u8, body: &[u8]) {
        self.outbox.put_u8(tag);
        self.outbox.put_i32(body.len() as i32 + 4);
        self.outbox.put_slice(body);
    }
}

fn length(mut bytes: &[u8]) -> usize {
    bytes.get_u32() as usize
}

fn cstr(buf: &mut &[u8]) -> String {
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    let value = String::from_utf8_lossy(&buf[..end]).into_owned();
    buf.advance((end + 1).min(buf.len()));
    value
}

fn between(s: &str, open: char, close: char) -> &str {
    let start = s.find(open).map_or(0, |i| i + 1);
    let end = s[start..].find(close).map_or(s.len(), |i| start + i);
    &s[start..end]
}

/// Client end of a [`MockServer`]
pub struct MockSocket {
    server: Rc<RefCell<MockServer>>,
}

impl MockSocket {
    /// A new connection; the server forgets the previous session
    pub fn new(server: &Rc<RefCell<MockServer>>) -> Self {
        {
            let mut server = server.borrow_mut();
            server.started = false;
            server.closed = false;
            server.inbox.clear();
            server.outbox.clear();
        }
        Self {
            server: Rc::clone(server),
        }
    }
}

impl Read for MockSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut server = self.server.borrow_mut();
        if server.outbox.is_empty() {
            if server.closed {
                return Ok(0);
            }
            return Err(ErrorKind::WouldBlock.into());
        }
        let mut n = buf.len().min(server.outbox.len());
        if server.read_chunk > 0 {
            n = n.min(server.read_chunk);
        }
        buf[..n].copy_from_slice(&server.outbox[..n]);
        server.outbox.advance(n);
        Ok(n)
    }
}

impl Write for MockSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut server = self.server.borrow_mut();
        server.write_calls += 1;
        if server.closed {
            return Err(ErrorKind::BrokenPipe.into());
        }
        if server.write_blocked
            || (server.stall_every > 0 && server.write_calls % server.stall_every == 0)
        {
            return Err(ErrorKind::WouldBlock.into());
        }
        let mut n = buf.len();
        if server.max_write_chunk > 0 {
            n = n.min(server.max_write_chunk);
        }
        server.receive(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Socket for MockSocket {
    fn set_nonblocking(&self, _nonblocking: bool) -> io::Result<()> {
        if self.server.borrow().refuse_nonblocking {
            return Err(io::Error::new(ErrorKind::Unsupported, "nonblocking refused"));
        }
        Ok(())
    }
}

/// Options with a short retry budget for tests
pub fn test_opts(policy: CommandErrorPolicy) -> Opts {
    let mut opts = Opts::new("mock", "piddb", "piduser", None);
    opts.retry = RetryPolicy {
        initial_delay: Duration::from_micros(10),
        max_delay: Duration::from_micros(200),
        timeout: Duration::from_millis(500),
    };
    opts.connect_timeout = Duration::from_millis(500);
    opts.on_command_error = policy;
    opts
}

pub fn connect(server: &Rc<RefCell<MockServer>>) -> Conn<MockSocket> {
    connect_with(server, CommandErrorPolicy::Log)
}

pub fn connect_with(server: &Rc<RefCell<MockServer>>, policy: CommandErrorPolicy) -> Conn<MockSocket> {
    Conn::new_with_stream(MockSocket::new(server), &test_opts(policy)).unwrap()
}

/// Hands out sockets to the same scripted server
pub struct MockConnector {
    pub server: Rc<RefCell<MockServer>>,
    pub refuse: bool,
}

impl MockConnector {
    pub fn new(server: &Rc<RefCell<MockServer>>) -> Self {
        Self {
            server: Rc::clone(server),
            refuse: false,
        }
    }
}

impl Connector for MockConnector {
    type Socket = MockSocket;

    fn connect(&mut self, opts: &Opts) -> Result<Conn<MockSocket>> {
        if self.refuse {
            return Err(io::Error::from(ErrorKind::ConnectionRefused).into());
        }
        Conn::new_with_stream(MockSocket::new(&self.server), opts)
    }
}
