use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};

use auto_impl::auto_impl;
use native_tls::{Certificate, HandshakeError, TlsConnector, TlsStream};
use tracing::debug;

use crate::constant::{SSL_ACCEPTED, SSL_REFUSED};
use crate::error::{Error, Result};
use crate::opts::Opts;
use crate::protocol::frontend;

/// Byte stream a [`Conn`](crate::sync::Conn) runs over
///
/// After startup the connection switches the socket to non-blocking mode and
/// treats `WouldBlock` as "try again later" in both directions.
#[auto_impl(&mut, Box)]
pub trait Socket: Read + Write {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()>;
}

pub enum Stream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Stream {
    /// Open a TCP connection and upgrade it to TLS with full verification
    ///
    /// There is no plaintext fallback: a server that refuses the SSLRequest
    /// fails the connection.
    #[tracing::instrument(skip_all, fields(host = %opts.host, port = opts.port))]
    pub fn connect(opts: &Opts) -> Result<Self> {
        let tcp = connect_tcp(opts)?;
        tcp.set_nodelay(opts.tcp_nodelay)?;
        tcp.set_read_timeout(Some(opts.connect_timeout))?;
        tcp.set_write_timeout(Some(opts.connect_timeout))?;
        Self::Tcp(tcp).upgrade_to_tls(opts)
    }

    pub fn upgrade_to_tls(self, opts: &Opts) -> Result<Self> {
        let mut tcp = match self {
            Self::Tcp(tcp) => tcp,
            Self::Tls(_) => {
                return Err(Error::InvalidUsage("Already using TLS".to_string()));
            }
        };

        let mut request = bytes::BytesMut::new();
        frontend::write_ssl_request(&mut request);
        tcp.write_all(&request)?;

        let mut reply = [0u8; 1];
        tcp.read_exact(&mut reply)?;
        match reply[0] {
            SSL_ACCEPTED => {}
            SSL_REFUSED => {
                return Err(Error::IoError(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "server does not accept TLS connections",
                )));
            }
            other => {
                return Err(Error::InvalidMessage(format!(
                    "Unexpected reply {:?} to SSLRequest",
                    other as char
                )));
            }
        }

        let pem = std::fs::read(&opts.ssl_root_cert).map_err(|e| {
            Error::BadConfigError(format!(
                "Cannot read root certificate {}: {}",
                opts.ssl_root_cert.display(),
                e
            ))
        })?;
        let connector = TlsConnector::builder()
            .add_root_certificate(Certificate::from_pem(&pem)?)
            .disable_built_in_roots(true)
            .build()?;

        let tls = connector.connect(&opts.host, tcp).map_err(|e| match e {
            HandshakeError::Failure(e) => Error::TlsError(e),
            HandshakeError::WouldBlock(_) => Error::Timeout {
                operation: "TLS handshake",
                attempts: 1,
            },
        })?;
        debug!("TLS established");
        Ok(Self::Tls(Box::new(tls)))
    }

    fn tcp(&self) -> &TcpStream {
        match self {
            Self::Tcp(tcp) => tcp,
            Self::Tls(tls) => tls.get_ref(),
        }
    }
}

fn connect_tcp(opts: &Opts) -> Result<TcpStream> {
    let mut last_err = None;
    for addr in (opts.host.as_str(), opts.port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, opts.connect_timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!(%addr, error = %e, "connect attempt failed");
                last_err = Some(e);
            }
        }
    }
    Err(match last_err {
        Some(e) => Error::IoError(e),
        None => Error::BadConfigError(format!("Host {} resolved to no addresses", opts.host)),
    })
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf),
            Self::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write(buf),
            Self::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.flush(),
            Self::Tls(s) => s.flush(),
        }
    }
}

impl Socket for Stream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.tcp().set_nonblocking(nonblocking)
    }
}
