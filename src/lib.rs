//! Site Trace: change-event detection for construction projects.

pub mod analysis;
pub mod api;
pub mod changes;
pub mod config;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod llm;
pub mod notify;
pub mod pipeline;
pub mod project;
pub mod store;
pub mod worker;
