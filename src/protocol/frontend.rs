//! Frontend message encoders.
//!
//! Every function appends one or more complete messages to `out`; nothing here
//! touches the socket.

use bytes::{BufMut, BytesMut};
use postgres_protocol::IsNull;
use postgres_protocol::message::frontend;

use crate::error::{Error, Result};

/// Write SSLRequest
pub fn write_ssl_request(out: &mut BytesMut) {
    frontend::ssl_request(out);
}

/// Write StartupMessage with the given parameters
pub fn write_startup<'a, I>(out: &mut BytesMut, params: I) -> Result<()>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    frontend::startup_message(params, out)?;
    Ok(())
}

/// Write PasswordMessage (cleartext or MD5 hash)
pub fn write_password(out: &mut BytesMut, password: &[u8]) -> Result<()> {
    frontend::password_message(password, out)?;
    Ok(())
}

/// Write SASLInitialResponse
pub fn write_sasl_initial(out: &mut BytesMut, mechanism: &str, data: &[u8]) -> Result<()> {
    frontend::sasl_initial_response(mechanism, data, out)?;
    Ok(())
}

/// Write SASLResponse
pub fn write_sasl_response(out: &mut BytesMut, data: &[u8]) -> Result<()> {
    frontend::sasl_response(data, out)?;
    Ok(())
}

/// Write Parse + Sync for a named statement with `param_count` untyped parameters
pub fn write_prepare(out: &mut BytesMut, name: &str, sql: &str, param_count: usize) -> Result<()> {
    frontend::parse(name, sql, std::iter::repeat_n(0, param_count), out)?;
    frontend::sync(out);
    Ok(())
}

/// Write Bind + Execute + Sync for a named statement with text-format parameters
pub fn write_execute<'a, I>(out: &mut BytesMut, name: &str, params: I) -> Result<()>
where
    I: IntoIterator<Item = &'a str>,
{
    let bound = frontend::bind(
        "",
        name,
        None::<i16>,
        params,
        |value: &str, buf: &mut BytesMut| {
            buf.put_slice(value.as_bytes());
            Ok(IsNull::No)
        },
        None::<i16>,
        out,
    );
    if let Err(err) = bound {
        return Err(match err {
            frontend::BindError::Conversion(e) => {
                Error::InvalidUsage(format!("Cannot encode parameter: {}", e))
            }
            frontend::BindError::Serialization(e) => Error::IoError(e),
        });
    }
    frontend::execute("", 0, out)?;
    frontend::sync(out);
    Ok(())
}

/// Write Query (simple query protocol)
pub fn write_query(out: &mut BytesMut, sql: &str) -> Result<()> {
    frontend::query(sql, out)?;
    Ok(())
}

/// Write Terminate
pub fn write_terminate(out: &mut BytesMut) {
    frontend::terminate(out);
}
