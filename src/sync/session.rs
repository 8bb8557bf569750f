use tracing::{debug, error, warn};

use crate::constant::ConnectionState;
use crate::error::{Error, Result};
use crate::opts::Opts;
use crate::prepared::StatementCache;
use crate::sync::conn::Conn;
use crate::sync::stream::{Socket, Stream};

/// Opens connections for a [`Session`]
pub trait Connector {
    type Socket: Socket;

    fn connect(&mut self, opts: &Opts) -> Result<Conn<Self::Socket>>;
}

/// TCP + verified TLS, the only production transport
#[derive(Debug, Clone, Copy, Default)]
pub struct TlsConnector;

impl Connector for TlsConnector {
    type Socket = Stream;

    fn connect(&mut self, opts: &Opts) -> Result<Conn<Stream>> {
        Conn::connect(opts)
    }
}

/// Owns at most one live connection and the statements prepared on it
pub struct Session<C: Connector = TlsConnector> {
    opts: Opts,
    connector: C,
    conn: Option<Conn<C::Socket>>,
    statements: StatementCache,
    state: ConnectionState,
}

impl Session<TlsConnector> {
    pub fn new(opts: Opts) -> Self {
        Self::with_connector(opts, TlsConnector)
    }
}

impl<C: Connector> Session<C> {
    pub fn with_connector(opts: Opts, connector: C) -> Self {
        Self {
            opts,
            connector,
            conn: None,
            statements: StatementCache::new(),
            state: ConnectionState::Disconnected,
        }
    }

    pub fn opts(&self) -> &Opts {
        &self.opts
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the current connection exists and has not seen a connection-level failure
    pub fn is_healthy(&self) -> bool {
        self.state == ConnectionState::Connected
            && self.conn.as_ref().is_some_and(|c| !c.is_broken())
    }

    /// Make sure a healthy connection exists
    ///
    /// Reuses the current connection when it is healthy. Otherwise the old one is
    /// dropped together with every statement prepared on it, and a new one is opened.
    pub fn connect(&mut self) -> Result<()> {
        if self.is_healthy() {
            return Ok(());
        }
        if let Some(old) = self.conn.take() {
            warn!(serial = old.serial(), "replacing broken connection");
        }
        self.statements.clear();
        self.state = ConnectionState::Connecting;

        match self.opts.validate().and_then(|()| self.connector.connect(&self.opts)) {
            Ok(conn) => {
                debug!(serial = conn.serial(), "session connected");
                self.conn = Some(conn);
                self.state = ConnectionState::Connected;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, host = %self.opts.host, "connection failed");
                self.state = ConnectionState::Failed;
                Err(Error::ConnectFailed(Box::new(e)))
            }
        }
    }

    pub fn conn(&mut self) -> Result<&mut Conn<C::Socket>> {
        self.conn.as_mut().ok_or(Error::ConnectionClosed)
    }

    /// The connection and its statement cache, borrowed together
    pub fn parts(&mut self) -> Result<(&mut Conn<C::Socket>, &mut StatementCache)> {
        let conn = self.conn.as_mut().ok_or(Error::ConnectionClosed)?;
        Ok((conn, &mut self.statements))
    }

    pub fn statements(&self) -> &StatementCache {
        &self.statements
    }

    /// Round trip to the server; a failure marks the session failed
    pub fn ping(&mut self) -> Result<()> {
        let result = self.conn()?.ping();
        if result.is_err() && self.conn.as_ref().is_none_or(Conn::is_broken) {
            self.state = ConnectionState::Failed;
        }
        result
    }

    /// Terminate the connection, if any
    pub fn disconnect(&mut self) -> Result<()> {
        self.statements.clear();
        self.state = ConnectionState::Disconnected;
        match self.conn.take() {
            Some(conn) => conn.close(),
            None => Ok(()),
        }
    }
}
