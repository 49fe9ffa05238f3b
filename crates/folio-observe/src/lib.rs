//! Tracing and OpenTelemetry setup shared by Folio binaries.

pub mod tracing_setup;
