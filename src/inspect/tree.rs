//! Variable tree navigation and comparison

use std::collections::VecDeque;

use futures_util::future::{BoxFuture, FutureExt};
use serde_json::{Map, Value};

use crate::common::{Error, Mismatch, MismatchReport, Result};
use crate::dap::{DapSession, Variable};

use super::expected::{quote, Expected, SUMMARY_KEY};

/// Default limit on how deep a comparison descends
pub const DEFAULT_MAX_DEPTH: usize = 32;

/// A child variable as the back end rendered it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableNode {
    pub name: String,
    pub value: String,
    /// Zero when the node cannot be expanded
    pub reference: i64,
}

impl VariableNode {
    pub fn is_expandable(&self) -> bool {
        self.reference != 0
    }
}

impl From<Variable> for VariableNode {
    fn from(variable: Variable) -> Self {
        Self {
            name: variable.name,
            value: variable.value,
            reference: variable.variables_reference,
        }
    }
}

/// Resolves container references through a session
///
/// Holds no state of its own; references are only meaningful while the
/// debuggee stays suspended at the same stop.
pub struct VariableTree<'a> {
    session: &'a DapSession,
    max_depth: usize,
}

/// Pending container in a comparison walk
struct Visit<'e> {
    path: String,
    reference: i64,
    children: &'e [(String, Expected)],
    depth: usize,
}

fn child_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else if name.starts_with('[') {
        format!("{}{}", parent, name)
    } else {
        format!("{}.{}", parent, name)
    }
}

impl<'a> VariableTree<'a> {
    pub fn new(session: &'a DapSession) -> Self {
        Self {
            session,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Children of a container, in back-end order
    pub async fn list_children(&self, reference: i64) -> Result<Vec<VariableNode>> {
        if reference == 0 {
            return Err(Error::InvalidReference {
                reference,
                message: "not an expandable container".to_string(),
            });
        }

        match self.session.variables(reference).await {
            Ok(variables) => Ok(variables.into_iter().map(VariableNode::from).collect()),
            Err(Error::DapRequestFailed { message, .. }) => {
                Err(Error::InvalidReference { reference, message })
            }
            Err(e) => Err(e),
        }
    }

    /// Container reference of a frame's local variables
    pub async fn frame_locals(&self, thread_id: i64, frame_index: usize) -> Result<i64> {
        let frames = self
            .session
            .stack_trace(thread_id, Some(frame_index as i64 + 1))
            .await?;
        let frame = frames.get(frame_index).ok_or_else(|| {
            Error::dap_request_failed(
                "stackTrace",
                &format!("thread {} has no frame {}", thread_id, frame_index),
            )
        })?;

        let scopes = self.session.scopes(frame.id).await?;
        scopes
            .iter()
            .find(|s| s.name.to_ascii_lowercase().starts_with("local"))
            .or_else(|| scopes.iter().find(|s| !s.expensive))
            .map(|s| s.variables_reference)
            .ok_or_else(|| {
                Error::dap_request_failed("scopes", &format!("frame '{}' has no locals", frame.name))
            })
    }

    /// Compare the tree under `reference` against an expected shape
    ///
    /// Walks the whole tree before failing, so the `Mismatch` error lists
    /// every divergent path. An unknown root reference fails immediately
    /// with `InvalidReference`.
    pub async fn compare_tree(&self, reference: i64, expected: &Expected) -> Result<()> {
        let Expected::Children { summary, children } = expected else {
            return Err(Error::TestAssertion(
                "expected tree root must be an object".to_string(),
            ));
        };

        let mut report = MismatchReport::default();
        if let Some(summary) = summary {
            report.mismatches.push(Mismatch {
                path: SUMMARY_KEY.to_string(),
                expected: quote(summary),
                actual: "<no summary at root>".to_string(),
            });
        }

        let mut queue = VecDeque::from([Visit {
            path: String::new(),
            reference,
            children,
            depth: 0,
        }]);

        while let Some(visit) = queue.pop_front() {
            let nodes = match self.list_children(visit.reference).await {
                Ok(nodes) => nodes,
                Err(e) if visit.depth == 0 => return Err(e),
                Err(Error::InvalidReference { message, .. }) => {
                    report.mismatches.push(Mismatch {
                        path: visit.path,
                        expected: "expandable".to_string(),
                        actual: format!("<invalid reference: {}>", message),
                    });
                    continue;
                }
                Err(e) => return Err(e),
            };

            for (name, want) in visit.children {
                let path = child_path(&visit.path, name);
                let Some(node) = nodes.iter().find(|n| &n.name == name) else {
                    report.mismatches.push(Mismatch {
                        path,
                        expected: want.to_string(),
                        actual: "<missing>".to_string(),
                    });
                    continue;
                };

                if let Some(actual) = want.check_value(&node.value) {
                    report.mismatches.push(Mismatch {
                        path,
                        expected: want.to_string(),
                        actual,
                    });
                    continue;
                }

                let Expected::Children { summary, children } = want else {
                    continue;
                };

                if let Some(summary) = summary {
                    if &node.value != summary {
                        report.mismatches.push(Mismatch {
                            path: child_path(&path, SUMMARY_KEY),
                            expected: quote(summary),
                            actual: quote(&node.value),
                        });
                    }
                }

                if children.is_empty() {
                    continue;
                }
                if !node.is_expandable() {
                    report.mismatches.push(Mismatch {
                        path,
                        expected: want.to_string(),
                        actual: format!("<not expandable: {}>", quote(&node.value)),
                    });
                } else if visit.depth + 1 >= self.max_depth {
                    report.mismatches.push(Mismatch {
                        path,
                        expected: want.to_string(),
                        actual: format!("<depth limit {} reached>", self.max_depth),
                    });
                } else {
                    queue.push_back(Visit {
                        path,
                        reference: node.reference,
                        children,
                        depth: visit.depth + 1,
                    });
                }
            }
        }

        if report.is_empty() {
            Ok(())
        } else {
            tracing::debug!(mismatches = report.mismatches.len(), "Variable tree differs");
            Err(Error::Mismatch(report))
        }
    }

    /// Render a subtree as JSON, `depth` levels deep
    ///
    /// Expandable nodes become objects with their value under `"$"`, so
    /// the output can be fed back as an expected tree.
    pub async fn snapshot(&self, reference: i64, depth: usize) -> Result<Value> {
        self.snapshot_boxed(reference, depth).await
    }

    fn snapshot_boxed(&self, reference: i64, depth: usize) -> BoxFuture<'_, Result<Value>> {
        async move {
            let mut object = Map::new();
            for node in self.list_children(reference).await? {
                let value = if node.is_expandable() && depth > 1 {
                    let mut child = match self.snapshot_boxed(node.reference, depth - 1).await? {
                        Value::Object(map) => map,
                        _ => Map::new(),
                    };
                    child.insert(SUMMARY_KEY.to_string(), Value::String(node.value));
                    Value::Object(child)
                } else {
                    Value::String(node.value)
                };
                object.insert(node.name, value);
            }
            Ok(Value::Object(object))
        }
        .boxed()
    }
}
