use crossbeam_queue::SegQueue;
use tracing::{debug, instrument};

use crate::command::Command;
use crate::error::Result;
use crate::prepared::StatementCache;
use crate::sync::conn::Conn;
use crate::sync::stream::Socket;

/// What one [`CommandQueue::pump`] call did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pump {
    /// Sent the front command
    Dispatched,
    /// Released one finished result
    Released,
    /// Waiting on the server
    Busy,
    /// No queued commands and nothing in flight
    Idle,
}

/// FIFO of commands fed to the connection one at a time
///
/// Enqueueing only needs a shared reference, so a producer on another thread can
/// fill the queue while the connection owner pumps it.
#[derive(Debug, Default)]
pub struct CommandQueue {
    commands: SegQueue<Command>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, command: Command) {
        self.commands.push(command);
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Make at most one unit of progress without blocking
    pub fn pump<S: Socket>(&self, conn: &mut Conn<S>, cache: &mut StatementCache) -> Result<Pump> {
        conn.flush()?;
        conn.consume_input()?;
        if conn.release_ready() {
            return Ok(Pump::Released);
        }
        if conn.is_busy() {
            return Ok(Pump::Busy);
        }
        match self.commands.pop() {
            Some(command) => {
                command.dispatch(conn, cache)?;
                Ok(Pump::Dispatched)
            }
            None => Ok(Pump::Idle),
        }
    }

    /// Pump until the queue is empty and every result is released
    ///
    /// Returns the number of commands dispatched.
    #[instrument(skip_all, fields(queued = self.len()))]
    pub fn run<S: Socket>(&self, conn: &mut Conn<S>, cache: &mut StatementCache) -> Result<usize> {
        let mut backoff = conn.retry_policy().backoff("command queue");
        let mut dispatched = 0;
        loop {
            match self.pump(conn, cache)? {
                Pump::Dispatched => {
                    dispatched += 1;
                    backoff.reset();
                }
                Pump::Released => backoff.reset(),
                Pump::Busy => backoff.wait()?,
                Pump::Idle => break,
            }
        }
        debug!(dispatched, "command queue drained");
        Ok(dispatched)
    }
}
