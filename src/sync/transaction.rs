use std::sync::Arc;

use tracing::{debug, error, instrument, warn};

use crate::constant::TransactionState;
use crate::error::{Error, Result};
use crate::opts::CommandErrorPolicy;
use crate::protocol::response::DrainReport;
use crate::sync::conn::Conn;
use crate::sync::stream::Socket;

/// A transaction bracket on one connection
///
/// BEGIN and COMMIT are pipelined like every other command: neither waits for its
/// own result. COMMIT is only written once all earlier output is flushed and every
/// earlier result has been read, so the server sees it strictly after the work it
/// commits. The connection must be passed to `commit` or `rollback`.
///
/// A transaction dropped without either is rolled back by the next `begin`.
/// A commit or rollback that fails on the way leaves the server in an unknown
/// state, so the connection is marked broken.
pub struct Transaction {
    serial: u64,
    _token: Arc<()>,
}

impl Transaction {
    /// Send BEGIN
    ///
    /// Under [`CommandErrorPolicy::Log`] a failure to send is logged and the
    /// transaction is opened anyway; the failure resurfaces from the next drain.
    #[instrument(skip_all)]
    pub fn begin<S: Socket>(conn: &mut Conn<S>) -> Result<Self> {
        if conn.is_broken() {
            return Err(Error::ConnectionClosed);
        }
        if conn.tx_state != TransactionState::Idle {
            if conn.tx_token.strong_count() > 0 {
                return Err(Error::InvalidUsage(
                    "A transaction is already open on this connection".to_string(),
                ));
            }
            Self::discard_abandoned(conn)?;
        } else if conn.server_in_transaction() {
            return Err(Error::InvalidUsage(
                "The server reports a transaction opened outside Transaction::begin".to_string(),
            ));
        }

        if let Err(e) = conn.send_query("BEGIN") {
            if conn.on_command_error() == CommandErrorPolicy::Abort {
                return Err(e);
            }
            error!(error = %e, "failed to send BEGIN");
        }
        conn.tx_state = TransactionState::Open;
        let token = Arc::new(());
        conn.tx_token = Arc::downgrade(&token);
        Ok(Self {
            serial: conn.serial(),
            _token: token,
        })
    }

    /// Roll back a transaction whose handle is gone
    fn discard_abandoned<S: Socket>(conn: &mut Conn<S>) -> Result<()> {
        warn!("previous transaction was abandoned, rolling it back");
        let result = conn.send_query("ROLLBACK").and_then(|_| conn.settle());
        conn.tx_state = TransactionState::Idle;
        if result.is_err() {
            conn.mark_broken();
        }
        result
    }

    fn check_connection<S: Socket>(&self, conn: &Conn<S>) -> Result<()> {
        let actual = conn.serial();
        if self.serial != actual {
            return Err(Error::ConnectionMismatch {
                expected: self.serial,
                actual,
            });
        }
        Ok(())
    }

    /// Flush, drain every outstanding result, then send COMMIT
    ///
    /// Returns what the drain collected. Under [`CommandErrorPolicy::Abort`] a
    /// drain with failures sends ROLLBACK instead and fails with
    /// [`Error::CommandFailed`].
    ///
    /// # Errors
    ///
    /// Returns `Error::ConnectionMismatch` if the connection is not the same
    /// as the one that started the transaction. Any failure other than that
    /// or `Error::CommandFailed` marks the connection broken.
    #[instrument(skip_all)]
    pub fn commit<S: Socket>(self, conn: &mut Conn<S>) -> Result<DrainReport> {
        self.check_connection(conn)?;
        conn.tx_state = TransactionState::Committing;
        let result = Self::flush_drain_commit(conn);
        conn.tx_state = TransactionState::Idle;
        // CommandFailed is the rollback that went through
        if let Err(e) = &result
            && !matches!(e, Error::CommandFailed(_))
        {
            conn.mark_broken();
        }
        result
    }

    fn flush_drain_commit<S: Socket>(conn: &mut Conn<S>) -> Result<DrainReport> {
        conn.consume_input()?;
        let waits = conn.flush_until_done()?;
        if waits > 0 {
            debug!(waits, "waited for pending output before commit");
        }
        let report = conn.drain()?;

        if conn.on_command_error() == CommandErrorPolicy::Abort
            && let Some(first) = report.failures.first()
        {
            warn!(
                failures = report.failures.len(),
                "rolling back instead of committing"
            );
            conn.send_query("ROLLBACK")?;
            conn.settle()?;
            return Err(Error::CommandFailed(first.clone()));
        }

        debug_assert!(!conn.pending_output(), "COMMIT behind unflushed output");
        debug_assert_eq!(conn.outstanding(), 0, "COMMIT behind unread results");
        conn.send_query("COMMIT")?;
        Ok(report)
    }

    /// Flush, drain every outstanding result, then send ROLLBACK
    ///
    /// # Errors
    ///
    /// Any failure other than a mismatch marks the connection broken.
    /// Returns `Error::ConnectionMismatch` if the connection is not the same
    /// as the one that started the transaction.
    #[instrument(skip_all)]
    pub fn rollback<S: Socket>(self, conn: &mut Conn<S>) -> Result<DrainReport> {
        self.check_connection(conn)?;
        conn.tx_state = TransactionState::Idle;
        let result = conn
            .drain()
            .and_then(|report| conn.send_query("ROLLBACK").map(|_| report));
        if result.is_err() {
            conn.mark_broken();
        }
        result
    }
}
