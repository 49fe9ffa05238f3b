//! Workflow engine and port trait definitions for Folio.
//!
//! This crate defines the "ports" (state store, unit executor, job runner)
//! that the infrastructure layer implements, plus the engine that drives a
//! batch job through split, dispatch, merge, retry, and finalization. It
//! depends only on `folio-types` -- never on `folio-infra` or any
//! database/IO crate.

pub mod event;
pub mod repository;
pub mod workflow;
