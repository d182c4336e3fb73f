//! Test scenario configuration types
//!
//! Defines the data structures for deserializing YAML test scenarios.

use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;

use crate::common::config::AdapterConfig;
use crate::launch::LaunchDocument;

/// A complete test scenario loaded from a YAML file
#[derive(Deserialize, Debug)]
pub struct TestScenario {
    /// Name of the test scenario
    pub name: String,
    /// Optional description of what the test verifies
    pub description: Option<String>,
    /// Optional setup steps to run before the test (e.g., compilation)
    pub setup: Option<Vec<SetupStep>>,
    /// Replaces the `[adapter]` section of the configuration
    pub adapter: Option<AdapterConfig>,
    /// Launch document, inline or as a path relative to the scenario
    pub launch: LaunchSource,
    /// The sequence of test steps to execute
    pub steps: Vec<TestStep>,
}

/// A setup step that runs before the test
#[derive(Deserialize, Debug)]
pub struct SetupStep {
    /// Shell command to execute
    pub shell: String,
}

/// Where the launch document comes from
#[derive(Deserialize, Debug)]
#[serde(untagged)]
pub enum LaunchSource {
    File(PathBuf),
    Inline(LaunchDocument),
}

/// A single test step in the execution flow
#[derive(Deserialize, Debug)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TestStep {
    /// Wait for the next user-visible stop
    AwaitStop {
        /// Timeout in milliseconds (default: the request timeout)
        timeout_ms: Option<u64>,
        /// Expected stop reason (e.g., "breakpoint")
        reason: Option<String>,
        /// Expected function name of the innermost frame (partial match)
        function: Option<String>,
        /// Expected line of the innermost frame
        line: Option<u32>,
    },
    /// Compare a frame's locals against an expected tree
    CompareLocals {
        /// Frame index (0 = innermost)
        #[serde(default)]
        frame: usize,
        /// Expected tree; `null` checks presence, `"$"` the summary
        expected: Value,
    },
    /// Evaluate an expression in the stopped frame
    Evaluate {
        expression: String,
        #[serde(default)]
        frame: usize,
        /// Whether the evaluation should succeed (default: true)
        success: Option<bool>,
        /// Expected result value
        result: Option<String>,
    },
    /// Resume the stopped thread
    Continue,
    /// Wait for the debuggee to exit
    ExpectExit {
        /// Expected exit code
        code: Option<i32>,
        /// Timeout in milliseconds (default: the request timeout)
        timeout_ms: Option<u64>,
    },
}
