pub mod connection;
pub mod frontend;
pub mod param;
pub mod response;

pub use param::ToParam;
pub use response::{DrainReport, PgResult, ResultStatus, ServerError};
