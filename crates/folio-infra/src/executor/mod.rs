//! Unit executors backed by external processes.

pub mod command;

pub use command::CommandExecutor;
