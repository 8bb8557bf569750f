use postgres_protocol::Oid;
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::opts::CommandErrorPolicy;
use crate::prepared::StatementCache;
use crate::protocol::param::ToParam;
use crate::sync::conn::{Conn, ResultPoll};
use crate::sync::stream::Socket;

/// Statement shape a command renders to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// `INSERT INTO t (c1, c2) VALUES ($1, $2)`
    Insert,
    /// `UPDATE t SET c1 = $1, c2 = $2 WHERE p = $3`
    Update,
}

/// One parameterized INSERT or UPDATE built from an ordered column list
///
/// Values are bound in the order the columns were added; the predicate value of an
/// UPDATE is bound last.
///
/// ```rs
/// let mut insert = Command::new("pid_insert").table("pids");
/// insert.add_column("pid", 1234)?.add_column("comm", "init")?;
/// insert.dispatch(conn, cache)?;
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Command {
    statement_id: String,
    table: String,
    columns: Vec<(String, String)>,
    predicate: Option<(String, String)>,
}

impl Command {
    pub fn new(statement_id: &str) -> Self {
        Self {
            statement_id: statement_id.to_string(),
            ..Default::default()
        }
    }

    pub fn table(mut self, table: &str) -> Self {
        self.set_table(table);
        self
    }

    pub fn set_table(&mut self, table: &str) {
        self.table = table.to_string();
    }

    pub fn set_statement_id(&mut self, statement_id: &str) {
        self.statement_id = statement_id.to_string();
    }

    pub fn statement_id(&self) -> &str {
        &self.statement_id
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    fn check_target(&self) -> Result<()> {
        if self.table.is_empty() {
            return Err(Error::MissingTable);
        }
        if self.statement_id.is_empty() {
            return Err(Error::MissingStatementId);
        }
        Ok(())
    }

    /// Append a column and the text form of its value
    pub fn add_column<T: ToParam>(&mut self, name: &str, value: T) -> Result<&mut Self> {
        self.check_target()?;
        self.columns.push((name.to_string(), value.to_param()));
        Ok(self)
    }

    /// Turn the command into an UPDATE of the rows where `column` equals `value`
    pub fn set_predicate<T: ToParam>(&mut self, column: &str, value: T) -> Result<&mut Self> {
        self.check_target()?;
        self.predicate = Some((column.to_string(), value.to_param()));
        Ok(self)
    }

    pub fn kind(&self) -> CommandKind {
        match self.predicate {
            Some(_) => CommandKind::Update,
            None => CommandKind::Insert,
        }
    }

    pub fn param_count(&self) -> usize {
        self.columns.len() + usize::from(self.predicate.is_some())
    }

    /// Parameter values in bind order
    pub fn params(&self) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .map(|(_, v)| v.as_str())
            .chain(self.predicate.iter().map(|(_, v)| v.as_str()))
    }

    /// The SQL text this command is prepared from
    pub fn render(&self) -> Result<String> {
        self.check_target()?;
        if self.columns.is_empty() {
            return Err(Error::NoColumns);
        }

        let sql = match &self.predicate {
            None => {
                let names: Vec<&str> = self.columns.iter().map(|(c, _)| c.as_str()).collect();
                let placeholders: Vec<String> =
                    (1..=self.columns.len()).map(|i| format!("${}", i)).collect();
                format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    self.table,
                    names.join(", "),
                    placeholders.join(", ")
                )
            }
            Some((column, _)) => {
                let assignments: Vec<String> = self
                    .columns
                    .iter()
                    .enumerate()
                    .map(|(i, (c, _))| format!("{} = ${}", c, i + 1))
                    .collect();
                format!(
                    "UPDATE {} SET {} WHERE {} = ${}",
                    self.table,
                    assignments.join(", "),
                    column,
                    self.columns.len() + 1
                )
            }
        };
        Ok(sql)
    }

    /// Send the command without waiting for its result
    ///
    /// The statement is prepared on first use. Before sending, buffered input is
    /// consumed and one result that is already complete is released, so results
    /// never pile up behind a long pipeline.
    #[instrument(skip_all, fields(id = %self.statement_id))]
    pub fn dispatch<S: Socket>(&self, conn: &mut Conn<S>, cache: &mut StatementCache) -> Result<()> {
        let sql = self.render()?;
        debug!(sql = %sql, "dispatch");
        cache.get_or_prepare(conn, &self.statement_id, &sql, self.param_count())?;

        conn.consume_input()?;
        conn.release_ready();
        if conn.on_command_error() == CommandErrorPolicy::Abort
            && let Some(err) = conn.first_failure()
        {
            return Err(Error::CommandFailed(err.clone()));
        }

        conn.send_query_prepared(&self.statement_id, self.params())
    }

    /// Read and release every outstanding result
    ///
    /// Returns the OID reported by the last successful result, which is 0 for tables
    /// without OIDs. Fails when the last result (this command's own, if it was the
    /// last one sent) failed, or under [`CommandErrorPolicy::Abort`] when any did.
    pub fn fetch_result<S: Socket>(&self, conn: &mut Conn<S>) -> Result<Oid> {
        conn.flush_until_done()?;
        let mut backoff = conn.retry_policy().backoff("fetch result");
        let mut first_failure = None;
        let mut last_failure = None;
        loop {
            conn.consume_input()?;
            match conn.get_result() {
                ResultPoll::Ready(result) => {
                    last_failure = result.error.clone();
                    if first_failure.is_none() {
                        first_failure.clone_from(&last_failure);
                    }
                    conn.release(result);
                    backoff.reset();
                }
                ResultPoll::Busy => backoff.wait()?,
                ResultPoll::Idle => break,
            }
        }

        if let Some(err) = last_failure {
            return Err(Error::CommandFailed(err));
        }
        if conn.on_command_error() == CommandErrorPolicy::Abort
            && let Some(err) = first_failure
        {
            return Err(Error::CommandFailed(err));
        }
        Ok(conn.report().last_oid)
    }
}
