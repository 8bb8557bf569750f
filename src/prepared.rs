use std::collections::HashMap;
use std::collections::hash_map::Entry;

use tracing::debug;

use crate::error::{Error, Result};
use crate::sync::conn::Conn;
use crate::sync::stream::Socket;

/// A statement prepared on the server under a logical id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedStatement {
    id: String,
    sql: String,
    param_count: usize,
}

impl PreparedStatement {
    /// Server-side statement name
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn param_count(&self) -> usize {
        self.param_count
    }
}

/// Logical statement id -> statement prepared on one connection
///
/// An id keeps its SQL for as long as the connection lives. The cache follows the
/// connection it is used with: a different connection empties it, and statements
/// the server reports missing are dropped so the next use prepares them again.
#[derive(Debug, Default)]
pub struct StatementCache {
    statements: HashMap<String, PreparedStatement>,
    serial: Option<u64>,
}

impl StatementCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&PreparedStatement> {
        self.statements.get(id)
    }

    pub fn clear(&mut self) {
        self.statements.clear();
        self.serial = None;
    }

    /// Forget one statement; returns whether it was cached
    pub fn invalidate(&mut self, id: &str) -> bool {
        self.statements.remove(id).is_some()
    }

    fn follow<S: Socket>(&mut self, conn: &mut Conn<S>) {
        if self.serial != Some(conn.serial()) {
            if !self.statements.is_empty() {
                debug!(
                    statements = self.statements.len(),
                    serial = conn.serial(),
                    "connection changed, dropping prepared statements"
                );
            }
            self.statements.clear();
            self.serial = Some(conn.serial());
        }
        for id in conn.take_invalidated_statements() {
            if self.invalidate(&id) {
                debug!(id = %id, "server lost prepared statement");
            }
        }
    }

    /// Look up `id`, preparing `sql` under it on first use
    ///
    /// A cached id whose SQL or parameter count differs from the request fails with
    /// [`Error::StatementMismatch`]; the cached statement stays as it was.
    pub fn get_or_prepare<S: Socket>(
        &mut self,
        conn: &mut Conn<S>,
        id: &str,
        sql: &str,
        param_count: usize,
    ) -> Result<&PreparedStatement> {
        if id.is_empty() {
            return Err(Error::MissingStatementId);
        }
        self.follow(conn);

        match self.statements.entry(id.to_string()) {
            Entry::Occupied(entry) => {
                let cached = entry.into_mut();
                if cached.param_count != param_count || cached.sql != sql {
                    return Err(Error::StatementMismatch {
                        id: id.to_string(),
                        expected_params: cached.param_count,
                        actual_params: param_count,
                    });
                }
                Ok(cached)
            }
            Entry::Vacant(entry) => {
                debug!(id, sql, "preparing statement");
                let result = conn.prepare(id, sql, param_count)?;
                if let Some(source) = result.error {
                    return Err(Error::PrepareFailed {
                        id: id.to_string(),
                        source,
                    });
                }
                Ok(entry.insert(PreparedStatement {
                    id: id.to_string(),
                    sql: sql.to_string(),
                    param_count,
                }))
            }
        }
    }
}
