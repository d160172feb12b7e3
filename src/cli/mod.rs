//! Command-line interface for priority-scheduler.
//!
//! Provides commands to run a scheduler node and to inspect the shared
//! Redis state.

mod commands;

pub use commands::{parse_cli, run, run_with_cli};
