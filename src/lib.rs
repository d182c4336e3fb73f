//! DAP Harness - a client-side Debug Adapter Protocol test harness
//!
//! This library supervises a debug adapter process, speaks DAP to it over
//! the port it announces, and inspects the variable trees it reports.

pub mod cli;
pub mod commands;
pub mod common;
pub mod dap;
pub mod harness;
pub mod inspect;
pub mod launch;
pub mod supervisor;
pub mod testing;

// Re-export commonly used types for tests
pub use common::{Error, Result};
pub use dap::DapSession;
pub use launch::BreakpointLocation;
