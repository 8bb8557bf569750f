pub mod buffer;
pub mod command;
pub mod constant;
pub mod error;
mod opts;
pub mod poll;
pub mod prepared;
pub mod proc;
pub mod protocol;
pub mod snapshot;
pub mod sync;

pub use command::{Command, CommandKind};
pub use error::{Error, Result};
pub use opts::{CommandErrorPolicy, Opts};
pub use prepared::{PreparedStatement, StatementCache};
pub use snapshot::{Snapshot, SnapshotSummary, record_snapshot};

#[cfg(test)]
mod opts_test;
