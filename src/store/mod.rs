//! Persistence layer: the store traits the engine consumes and the
//! libSQL backend that implements them.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    Account, AccountStore, AuditRecord, AuditSink, AuditStatus, IssueLog, OutcomeLedger,
    SessionStore, TaskSource,
};
