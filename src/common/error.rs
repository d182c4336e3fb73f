//! Error types for the harness
//!
//! Error messages are meant to be read by whoever is driving the session,
//! so they name the adapter, command or reference that went wrong.

use std::fmt;
use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the harness
#[derive(Error, Debug)]
pub enum Error {
    // === Process Errors ===
    #[error("Failed to start debug adapter '{program}': {reason}")]
    Spawn { program: String, reason: String },

    #[error("Debug adapter did not announce itself within {0} ms")]
    HandshakeTimeout(u64),

    #[error("Debug adapter exited before the handshake ({exit})\n--- adapter output ---\n{output}")]
    PrematureExit { exit: ExitInfo, output: String },

    // === Session Errors ===
    #[error("Session terminated: {0}")]
    SessionTerminated(String),

    #[error("Debug adapter never sent 'initialized': {0}")]
    Handshake(String),

    #[error("Operation '{operation}' timed out after {millis} ms")]
    Timeout { operation: String, millis: u64 },

    // === DAP Protocol Errors ===
    #[error("DAP protocol error: {0}")]
    DapProtocol(String),

    #[error("DAP request '{command}' failed: {message}")]
    DapRequestFailed { command: String, message: String },

    // === Variable Tree Errors ===
    #[error("Invalid variables reference {reference}: {message}")]
    InvalidReference { reference: i64, message: String },

    #[error("Variable tree mismatch:\n{0}")]
    Mismatch(MismatchReport),

    // === Configuration Errors ===
    #[error("Cyclic reference while expanding '${{{0}}}'")]
    CyclicReference(String),

    #[error("Undefined reference '${{{0}}}'")]
    UndefinedReference(String),

    #[error("Invalid breakpoint location: {0}")]
    InvalidLocation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Test Errors ===
    #[error("Test assertion failed: {0}")]
    TestAssertion(String),

    // === Internal Errors ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a DAP request failed error
    pub fn dap_request_failed(command: &str, message: &str) -> Self {
        Self::DapRequestFailed {
            command: command.to_string(),
            message: message.to_string(),
        }
    }

    /// Create a spawn error for an adapter program
    pub fn spawn(program: impl fmt::Display, reason: impl fmt::Display) -> Self {
        Self::Spawn {
            program: program.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Create a timeout error for a named operation
    pub fn timeout(operation: &str, millis: u64) -> Self {
        Self::Timeout {
            operation: operation.to_string(),
            millis,
        }
    }
}

/// How the adapter process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitInfo {
    /// Exit code, if the process exited normally
    pub code: Option<i32>,
    /// Terminating signal (unix only)
    pub signal: Option<i32>,
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "killed by signal {}", signal),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// One divergence found while comparing a variable tree
#[derive(Debug, Clone, PartialEq)]
pub struct Mismatch {
    /// Dotted path of the node, e.g. `s.inner.b`
    pub path: String,
    pub expected: String,
    pub actual: String,
}

/// Every divergence found by a single tree comparison
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MismatchReport {
    pub mismatches: Vec<Mismatch>,
}

impl MismatchReport {
    /// Paths of all divergent nodes, in discovery order
    pub fn paths(&self) -> Vec<&str> {
        self.mismatches.iter().map(|m| m.path.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.mismatches.is_empty()
    }
}

impl fmt::Display for MismatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for m in &self.mismatches {
            writeln!(f, "  {}: expected {}, got {}", m.path, m.expected, m.actual)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_info_display() {
        let exited = ExitInfo { code: Some(3), signal: None };
        assert_eq!(exited.to_string(), "exit code 3");

        let killed = ExitInfo { code: None, signal: Some(9) };
        assert_eq!(killed.to_string(), "killed by signal 9");
    }

    #[test]
    fn test_mismatch_report_lists_every_path() {
        let report = MismatchReport {
            mismatches: vec![
                Mismatch {
                    path: "b".to_string(),
                    expected: "\"x\"".to_string(),
                    actual: "\"y\"".to_string(),
                },
                Mismatch {
                    path: "s.c".to_string(),
                    expected: "present".to_string(),
                    actual: "<missing>".to_string(),
                },
            ],
        };

        assert_eq!(report.paths(), vec!["b", "s.c"]);
        let text = Error::Mismatch(report).to_string();
        assert!(text.contains("b: expected \"x\", got \"y\""));
        assert!(text.contains("s.c: expected present"));
    }

    #[test]
    fn test_reference_errors_name_the_symbol() {
        let err = Error::CyclicReference("dbgconfig:a".to_string());
        assert_eq!(err.to_string(), "Cyclic reference while expanding '${dbgconfig:a}'");
    }
}
