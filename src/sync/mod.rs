//! Blocking-free connection layer over a non-blocking socket
//!
//! Nothing here waits on the network except through a [`RetryPolicy`](crate::poll::RetryPolicy)
//! backoff, and every wait is bounded.

pub mod conn;
pub mod queue;
pub mod session;
pub mod stream;
pub mod transaction;

#[cfg(test)]
pub(crate) mod mock;

pub use conn::{Conn, Flush, ResultPoll};
pub use queue::{CommandQueue, Pump};
pub use session::{Connector, Session, TlsConnector};
pub use stream::{Socket, Stream};
pub use transaction::Transaction;
