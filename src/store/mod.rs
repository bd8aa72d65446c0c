//! Persistence layer: libSQL-backed storage for projects, ingest events,
//! change events, and their audit log.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{ClaimOutcome, Database, StatusChange, TransitionOutcome};
