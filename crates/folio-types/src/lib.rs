//! Shared domain types for Folio.
//!
//! This crate contains the persisted workflow snapshot model, the events
//! broadcast while a job runs, configuration structs, and the repository
//! error type used by the port traits in `folio-core`.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod workflow;
