//! Launch documents
//!
//! A launch document is a JSON object holding the adapter's launch or
//! attach arguments, an optional `dbgconfig` map of symbolic definitions
//! and optional initial breakpoints. Everything is expanded before any
//! process is spawned.

pub mod expand;

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::common::{Error, Result};

pub use expand::{DbgConfigDocument, Expander};

/// Which composite start-up the session performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    #[default]
    Launch,
    Attach,
}

impl RequestKind {
    /// DAP command name
    pub fn command(self) -> &'static str {
        match self {
            Self::Launch => "launch",
            Self::Attach => "attach",
        }
    }
}

/// Breakpoint location from a launch document or the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakpointLocation {
    /// File and line number
    Line { file: PathBuf, line: u32 },
    /// Function name
    Function { name: String },
}

impl BreakpointLocation {
    /// Parse a location string like "file.rs:42" or "main"
    pub fn parse(s: &str) -> Result<Self> {
        // Only the last ':' followed by digits splits file from line, so
        // Windows paths like "C:\src\main.rs:10" still work
        if let Some(colon_idx) = s.rfind(':') {
            let (file_part, line_part) = s.split_at(colon_idx);
            let line_str = &line_part[1..];

            if !line_str.is_empty() && line_str.chars().all(|c| c.is_ascii_digit()) {
                let line: u32 = line_str.parse().map_err(|_| {
                    Error::InvalidLocation(format!("invalid line number: {}", line_str))
                })?;
                if file_part.is_empty() {
                    return Err(Error::InvalidLocation(format!("missing file in '{}'", s)));
                }
                return Ok(Self::Line {
                    file: PathBuf::from(file_part),
                    line,
                });
            }
        }

        if s.trim().is_empty() {
            return Err(Error::InvalidLocation("empty location".to_string()));
        }
        Ok(Self::Function {
            name: s.to_string(),
        })
    }
}

/// Launch document as written on disk
#[derive(Debug, Clone, Deserialize)]
pub struct LaunchDocument {
    /// Launch or attach
    #[serde(default)]
    pub request: RequestKind,

    /// Symbolic definitions referenced as `${dbgconfig:name}`
    #[serde(default)]
    pub dbgconfig: DbgConfigDocument,

    /// Initial breakpoints, set before `configurationDone`
    #[serde(default)]
    pub breakpoints: Vec<String>,

    /// Everything else is passed to the adapter as request arguments
    #[serde(flatten)]
    pub arguments: Map<String, Value>,
}

/// Launch document with every reference resolved
#[derive(Debug, Clone)]
pub struct ResolvedLaunch {
    pub request: RequestKind,
    pub arguments: Value,
    pub breakpoints: Vec<BreakpointLocation>,
}

impl LaunchDocument {
    /// Load a launch document from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        serde_json::from_str(&content)
            .map_err(|e| Error::ConfigParse(format!("{}: {}", path.display(), e)))
    }

    /// Expand `dbgconfig`, then the arguments and breakpoints against it
    pub fn resolve(&self, expander: &Expander) -> Result<ResolvedLaunch> {
        let dbgconfig = expander.expand(&self.dbgconfig)?;

        let mut arguments = self.arguments.clone();
        arguments.insert(
            "request".to_string(),
            Value::String(self.request.command().to_string()),
        );
        let arguments = expander.expand_value(&dbgconfig, &Value::Object(arguments))?;

        let breakpoints = self
            .breakpoints
            .iter()
            .map(|bp| {
                let text = expander.expand_value(&dbgconfig, &Value::String(bp.clone()))?;
                BreakpointLocation::parse(text.as_str().unwrap_or_default())
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(ResolvedLaunch {
            request: self.request,
            arguments,
            breakpoints,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_locations() {
        assert_eq!(
            BreakpointLocation::parse("src/main.rs:42").unwrap(),
            BreakpointLocation::Line {
                file: PathBuf::from("src/main.rs"),
                line: 42
            }
        );
        assert_eq!(
            BreakpointLocation::parse("C:\\src\\main.rs:7").unwrap(),
            BreakpointLocation::Line {
                file: PathBuf::from("C:\\src\\main.rs"),
                line: 7
            }
        );
        assert_eq!(
            BreakpointLocation::parse("ns::main").unwrap(),
            BreakpointLocation::Function {
                name: "ns::main".to_string()
            }
        );
        assert!(BreakpointLocation::parse(":12").is_err());
        assert!(BreakpointLocation::parse("  ").is_err());
    }

    #[test]
    fn test_resolve_document() {
        let document: LaunchDocument = serde_json::from_str(
            r#"{
                "request": "launch",
                "dbgconfig": { "out": "${env:ROOT}/target/debug" },
                "program": "${dbgconfig:out}/app",
                "args": ["-n", "3"],
                "stopOnEntry": false,
                "breakpoints": ["${env:ROOT}/src/main.rs:12", "compute"]
            }"#,
        )
        .unwrap();

        let expander = Expander::with_env(HashMap::from([("ROOT".to_string(), "/w".to_string())]));
        let resolved = document.resolve(&expander).unwrap();

        assert_eq!(resolved.request, RequestKind::Launch);
        assert_eq!(resolved.arguments["program"], "/w/target/debug/app");
        assert_eq!(resolved.arguments["request"], "launch");
        assert_eq!(resolved.arguments["stopOnEntry"], false);
        assert!(resolved.arguments.get("dbgconfig").is_none());
        assert_eq!(
            resolved.breakpoints,
            vec![
                BreakpointLocation::Line {
                    file: PathBuf::from("/w/src/main.rs"),
                    line: 12
                },
                BreakpointLocation::Function {
                    name: "compute".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_attach_document_defaults() {
        let document: LaunchDocument =
            serde_json::from_str(r#"{ "request": "attach", "pid": 1234 }"#).unwrap();
        let resolved = document.resolve(&Expander::with_env(HashMap::new())).unwrap();
        assert_eq!(resolved.request, RequestKind::Attach);
        assert_eq!(resolved.arguments["pid"], 1234);
        assert!(resolved.breakpoints.is_empty());
    }
}
