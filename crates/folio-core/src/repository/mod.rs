//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (folio-infra) implements. The core crate never depends on any specific
//! storage technology. `memory` holds an in-process implementation used by
//! tests and embedded callers.

pub mod memory;
pub mod state_store;

pub use memory::InMemoryStateStore;
pub use state_store::StateStore;
