//! Batch workflow engine.
//!
//! A job flows through `splitter` (partition inputs into work items),
//! `coordinator` (wave dispatch, merge, retry), and `finalizer` (ordered
//! reduction into an artifact). `merge` holds the pure snapshot merge rules,
//! `retry` the attempt budget, and `executor` the unit-of-work port.
//! `runner` hosts coordinator executions; `controller` is the entry point
//! used by callers to start, resume, observe, and cancel jobs.

pub mod controller;
pub mod coordinator;
pub mod executor;
pub mod finalizer;
pub mod merge;
pub mod retry;
pub mod runner;
pub mod splitter;
