use fallible_iterator::FallibleIterator;
use postgres_protocol::Oid;
use postgres_protocol::message::backend::{self, DataRowBody, ErrorFields, RowDescriptionBody};

use crate::constant::{INVALID_OID, TransactionStatus};
use crate::error::{Error, Result};

/// ErrorResponse / NoticeResponse payload
#[derive(Debug, Clone, Default, PartialEq, Eq, thiserror::Error)]
#[error("{severity} {code}: {message}")]
pub struct ServerError {
    pub severity: String,
    /// SQLSTATE
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
}

impl ServerError {
    pub fn parse(mut fields: ErrorFields<'_>) -> Result<Self> {
        let mut err = ServerError::default();
        while let Some(field) = fields.next()? {
            let value = text(field.value_bytes());
            match field.type_() {
                // 'V' is the non-localized severity; prefer it over 'S'
                b'V' => err.severity = value,
                b'S' if err.severity.is_empty() => err.severity = value,
                b'C' => err.code = value,
                b'M' => err.message = value,
                b'D' => err.detail = Some(value),
                b'H' => err.hint = Some(value),
                _ => {}
            }
        }
        Ok(err)
    }

    /// FATAL and PANIC end the session
    pub fn is_fatal(&self) -> bool {
        matches!(self.severity.as_str(), "FATAL" | "PANIC")
    }
}

fn text(bytes: &[u8]) -> String {
    match simdutf8::basic::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    /// A command that returns no rows completed
    CommandOk,
    /// A query returned rows (possibly zero)
    TuplesOk,
    /// The query string was empty
    EmptyQuery,
    FatalError,
}

/// One result of a sent command, delivered in send order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgResult {
    pub status: ResultStatus,
    /// CommandComplete tag, e.g. `INSERT 0 1`
    pub tag: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
    pub error: Option<ServerError>,
}

impl PgResult {
    fn completed(tag: String, columns: Vec<String>, rows: Vec<Vec<Option<String>>>) -> Self {
        let status = if columns.is_empty() {
            ResultStatus::CommandOk
        } else {
            ResultStatus::TuplesOk
        };
        Self {
            status,
            tag,
            columns,
            rows,
            error: None,
        }
    }

    fn empty(status: ResultStatus) -> Self {
        Self {
            status,
            tag: String::new(),
            columns: Vec::new(),
            rows: Vec::new(),
            error: None,
        }
    }

    pub fn failed(error: ServerError) -> Self {
        Self {
            error: Some(error),
            ..Self::empty(ResultStatus::FatalError)
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status != ResultStatus::FatalError
    }

    /// OID of the inserted row, taken from an `INSERT <oid> <rows>` tag
    pub fn oid(&self) -> Oid {
        let mut parts = self.tag.split_ascii_whitespace();
        match (parts.next(), parts.next()) {
            (Some("INSERT"), Some(oid)) => oid.parse().unwrap_or(INVALID_OID),
            _ => INVALID_OID,
        }
    }

    /// Row count at the end of the tag, if the command reports one
    pub fn rows_affected(&self) -> Option<u64> {
        self.tag.rsplit(' ').next()?.parse().ok()
    }

    pub fn get(&self, row: usize, column: usize) -> Option<&str> {
        self.rows.get(row)?.get(column)?.as_deref()
    }

    /// Turn a failed result into its server error
    pub fn into_result(self) -> Result<Self> {
        match self.error {
            Some(err) => Err(Error::ServerError(err)),
            None => Ok(self),
        }
    }
}

/// What a backend message meant to the connection
#[derive(Debug)]
pub enum BackendEvent {
    /// A result is complete
    Result(PgResult),
    /// ReadyForQuery: the current request is finished
    Ready(TransactionStatus),
    Notice(ServerError),
    Parameter(String, String),
    BackendKey { process_id: i32, secret_key: i32 },
    /// Consumed without a visible effect
    None,
}

/// Assembles backend messages into results
///
/// Holds the row description and rows of the result currently being received.
#[derive(Debug, Default)]
pub struct ResultAssembler {
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
}

impl ResultAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, message: backend::Message) -> Result<BackendEvent> {
        use backend::Message;

        let event = match message {
            Message::ParseComplete | Message::CloseComplete => {
                BackendEvent::Result(PgResult::empty(ResultStatus::CommandOk))
            }
            Message::BindComplete | Message::NoData | Message::ParameterDescription(_) => {
                BackendEvent::None
            }
            Message::RowDescription(body) => {
                self.columns = columns(&body)?;
                BackendEvent::None
            }
            Message::DataRow(body) => {
                self.rows.push(row(&body)?);
                BackendEvent::None
            }
            Message::CommandComplete(body) => {
                let tag = body.tag()?.to_string();
                let columns = std::mem::take(&mut self.columns);
                let rows = std::mem::take(&mut self.rows);
                BackendEvent::Result(PgResult::completed(tag, columns, rows))
            }
            Message::EmptyQueryResponse => {
                BackendEvent::Result(PgResult::empty(ResultStatus::EmptyQuery))
            }
            Message::ErrorResponse(body) => {
                self.columns.clear();
                self.rows.clear();
                BackendEvent::Result(PgResult::failed(ServerError::parse(body.fields())?))
            }
            Message::NoticeResponse(body) => BackendEvent::Notice(ServerError::parse(body.fields())?),
            Message::ParameterStatus(body) => {
                BackendEvent::Parameter(body.name()?.to_string(), body.value()?.to_string())
            }
            Message::BackendKeyData(body) => BackendEvent::BackendKey {
                process_id: body.process_id(),
                secret_key: body.secret_key(),
            },
            Message::ReadyForQuery(body) => {
                let status = TransactionStatus::from_byte(body.status()).ok_or_else(|| {
                    Error::InvalidMessage(format!(
                        "Unknown transaction status {:?} in ReadyForQuery",
                        body.status() as char
                    ))
                })?;
                BackendEvent::Ready(status)
            }
            Message::NotificationResponse(_) => BackendEvent::None,
            _ => {
                return Err(Error::InvalidMessage(
                    "Unexpected backend message for a pipelined command".to_string(),
                ));
            }
        };
        Ok(event)
    }
}

fn columns(body: &RowDescriptionBody) -> Result<Vec<String>> {
    let names = body
        .fields()
        .map(|field| Ok(field.name().to_string()))
        .collect::<Vec<_>>()?;
    Ok(names)
}

fn row(body: &DataRowBody) -> Result<Vec<Option<String>>> {
    let buffer = body.buffer();
    let values = body
        .ranges()
        .map(|range| Ok(range.map(|r| text(&buffer[r]))))
        .collect::<Vec<_>>()?;
    Ok(values)
}

/// Accumulated outcome of the results released since the previous drain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Number of results fetched and released
    pub released: usize,
    /// Server errors of failed results, in send order
    pub failures: Vec<ServerError>,
    /// OID reported by the last successful result
    pub last_oid: Oid,
    /// Tag of the last successful result
    pub last_tag: Option<String>,
}

impl DrainReport {
    pub fn record(&mut self, result: &PgResult) {
        self.released += 1;
        match &result.error {
            Some(err) => self.failures.push(err.clone()),
            None => {
                self.last_oid = result.oid();
                self.last_tag = Some(result.tag.clone());
            }
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.released - self.failures.len()
    }
}
