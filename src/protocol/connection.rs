//! Startup and authentication, as a state machine that never touches the socket.
//!
//! The caller writes what [`Startup::start`] / [`Startup::drive`] put into the
//! output buffer, reads the next backend message, and feeds it back until
//! [`StartupStep::Done`].

use bytes::BytesMut;
use fallible_iterator::FallibleIterator;
use postgres_protocol::authentication::md5_hash;
use postgres_protocol::authentication::sasl::{self, ChannelBinding, ScramSha256};
use postgres_protocol::message::backend::Message;

use crate::constant::TransactionStatus;
use crate::error::{Error, Result};
use crate::opts::Opts;
use crate::protocol::frontend;
use crate::protocol::response::ServerError;

/// Whatever the server told us before its first ReadyForQuery
#[derive(Debug, Clone, Default)]
pub struct ServerInfo {
    pub parameters: Vec<(String, String)>,
    pub process_id: i32,
    pub secret_key: i32,
    pub transaction_status: TransactionStatus,
}

#[derive(Debug)]
pub enum StartupStep {
    /// Send whatever was written (may be nothing) and feed the next message
    Continue,
    Done(ServerInfo),
}

enum State {
    Initial,
    Authenticating,
    SaslContinue(Box<ScramSha256>),
    SaslFinal(Box<ScramSha256>),
    /// Authenticated; collecting parameters until ReadyForQuery
    Settling,
    Done,
}

pub struct Startup {
    user: String,
    password: Option<String>,
    dbname: String,
    application_name: Option<String>,
    state: State,
    info: ServerInfo,
}

impl Startup {
    pub fn new(opts: &Opts) -> Self {
        Self {
            user: opts.user.clone(),
            password: opts.password.clone(),
            dbname: opts.effective_dbname().to_string(),
            application_name: opts.application_name.clone(),
            state: State::Initial,
            info: ServerInfo::default(),
        }
    }

    /// Write the StartupMessage
    pub fn start(&mut self, out: &mut BytesMut) -> Result<()> {
        if !matches!(self.state, State::Initial) {
            return Err(Error::InvalidUsage("Startup already started".to_string()));
        }
        let mut params = vec![
            ("user", self.user.as_str()),
            ("database", self.dbname.as_str()),
            ("client_encoding", "UTF8"),
        ];
        if let Some(name) = &self.application_name {
            params.push(("application_name", name.as_str()));
        }
        frontend::write_startup(out, params)?;
        self.state = State::Authenticating;
        Ok(())
    }

    pub fn drive(&mut self, message: Message, out: &mut BytesMut) -> Result<StartupStep> {
        if let Message::ErrorResponse(body) = &message {
            self.state = State::Done;
            return Err(Error::ServerError(ServerError::parse(body.fields())?));
        }

        match std::mem::replace(&mut self.state, State::Done) {
            State::Authenticating => self.authenticate(message, out),
            State::SaslContinue(mut scram) => match message {
                Message::AuthenticationSaslContinue(body) => {
                    scram.update(body.data())?;
                    frontend::write_sasl_response(out, scram.message())?;
                    self.state = State::SaslFinal(scram);
                    Ok(StartupStep::Continue)
                }
                _ => Err(unexpected("SASL continue")),
            },
            State::SaslFinal(mut scram) => match message {
                Message::AuthenticationSaslFinal(body) => {
                    scram.finish(body.data())?;
                    self.state = State::Authenticating;
                    Ok(StartupStep::Continue)
                }
                _ => Err(unexpected("SASL final")),
            },
            State::Settling => self.settle(message),
            State::Initial | State::Done => Err(Error::InvalidUsage(
                "Startup is not in progress".to_string(),
            )),
        }
    }

    fn authenticate(&mut self, message: Message, out: &mut BytesMut) -> Result<StartupStep> {
        match message {
            Message::AuthenticationOk => {
                self.state = State::Settling;
            }
            Message::AuthenticationCleartextPassword => {
                let password = self.password()?;
                frontend::write_password(out, password.as_bytes())?;
                self.state = State::Authenticating;
            }
            Message::AuthenticationMd5Password(body) => {
                let hash = md5_hash(self.user.as_bytes(), self.password()?.as_bytes(), body.salt());
                frontend::write_password(out, hash.as_bytes())?;
                self.state = State::Authenticating;
            }
            Message::AuthenticationSasl(body) => {
                let mechanisms = body
                    .mechanisms()
                    .map(|m| Ok(m.to_string()))
                    .collect::<Vec<_>>()?;
                if !mechanisms.iter().any(|m| m == sasl::SCRAM_SHA_256) {
                    return Err(Error::UnsupportedAuth(mechanisms.join(", ")));
                }
                let scram =
                    ScramSha256::new(self.password()?.as_bytes(), ChannelBinding::unsupported());
                frontend::write_sasl_initial(out, sasl::SCRAM_SHA_256, scram.message())?;
                self.state = State::SaslContinue(Box::new(scram));
            }
            Message::AuthenticationKerberosV5 => {
                return Err(Error::UnsupportedAuth("Kerberos V5".to_string()));
            }
            Message::AuthenticationScmCredential => {
                return Err(Error::UnsupportedAuth("SCM credential".to_string()));
            }
            Message::AuthenticationGss | Message::AuthenticationGssContinue(_) => {
                return Err(Error::UnsupportedAuth("GSSAPI".to_string()));
            }
            Message::AuthenticationSspi => {
                return Err(Error::UnsupportedAuth("SSPI".to_string()));
            }
            _ => return Err(unexpected("authentication")),
        }
        Ok(StartupStep::Continue)
    }

    fn settle(&mut self, message: Message) -> Result<StartupStep> {
        match message {
            Message::ParameterStatus(body) => {
                self.info
                    .parameters
                    .push((body.name()?.to_string(), body.value()?.to_string()));
            }
            Message::BackendKeyData(body) => {
                self.info.process_id = body.process_id();
                self.info.secret_key = body.secret_key();
            }
            Message::NoticeResponse(body) => {
                let notice = ServerError::parse(body.fields())?;
                tracing::warn!(code = %notice.code, "{}", notice.message);
            }
            Message::ReadyForQuery(body) => {
                self.info.transaction_status = TransactionStatus::from_byte(body.status())
                    .ok_or_else(|| unexpected("ReadyForQuery status"))?;
                return Ok(StartupStep::Done(std::mem::take(&mut self.info)));
            }
            _ => return Err(unexpected("startup")),
        }
        self.state = State::Settling;
        Ok(StartupStep::Continue)
    }

    fn password(&self) -> Result<&str> {
        self.password.as_deref().ok_or_else(|| {
            Error::BadConfigError("Server requested a password but none is configured".to_string())
        })
    }
}

fn unexpected(phase: &str) -> Error {
    Error::InvalidMessage(format!("Unexpected backend message during {}", phase))
}
