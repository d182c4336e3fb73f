//! Scenario test runner
//!
//! Reads YAML scenarios that drive a debuggee through stops and assert on
//! the variable trees and expressions the adapter reports.

mod config;
mod runner;

pub use config::*;
pub use runner::{load_scenario, run_scenario, TestResult};
