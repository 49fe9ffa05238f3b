//! Infrastructure layer for Folio.
//!
//! Contains implementations of the ports defined in `folio-core`: the SQLite
//! snapshot store, the process-per-unit executor, configuration loading, and
//! data directory resolution.

pub mod config;
pub mod executor;
pub mod filesystem;
pub mod sqlite;
