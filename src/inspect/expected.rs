//! Expected shape of a variable tree

use std::fmt;

use serde_json::Value;

use crate::common::{Error, Result};

/// Object key holding the expected summary of the enclosing node
pub const SUMMARY_KEY: &str = "$";

/// What a node is expected to look like
#[derive(Debug, Clone, PartialEq)]
pub enum Expected {
    /// Node must exist; its value is not checked
    Present,
    /// Rendered value must match exactly
    Text(String),
    /// Rendered value must parse to this number
    Number(f64),
    /// Node must be expandable into at least these children
    Children {
        summary: Option<String>,
        children: Vec<(String, Expected)>,
    },
}

impl Expected {
    /// Build from JSON
    ///
    /// `null` checks presence, strings and booleans compare as text,
    /// numbers numerically. Objects recurse, with `"$"` naming the summary;
    /// arrays recurse with children named `[0]`, `[1]`, ...
    pub fn from_json(value: &Value) -> Result<Self> {
        Ok(match value {
            Value::Null => Self::Present,
            Value::Bool(b) => Self::Text(b.to_string()),
            Value::String(s) => Self::Text(s.clone()),
            Value::Number(n) => Self::Number(n.as_f64().ok_or_else(|| {
                Error::Config(format!("expected value {} is not representable", n))
            })?),
            Value::Array(items) => Self::Children {
                summary: None,
                children: items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| Ok((format!("[{}]", i), Self::from_json(item)?)))
                    .collect::<Result<_>>()?,
            },
            Value::Object(map) => {
                let mut summary = None;
                let mut children = Vec::with_capacity(map.len());
                for (key, item) in map {
                    if key == SUMMARY_KEY {
                        summary = Some(match item {
                            Value::String(s) => s.clone(),
                            Value::Number(_) | Value::Bool(_) => item.to_string(),
                            _ => {
                                return Err(Error::Config(format!(
                                    "summary '{}' must be a string",
                                    SUMMARY_KEY
                                )))
                            }
                        });
                    } else {
                        children.push((key.clone(), Self::from_json(item)?));
                    }
                }
                Self::Children { summary, children }
            }
        })
    }

    /// Check a rendered leaf value; `None` when it matches
    pub(crate) fn check_value(&self, actual: &str) -> Option<String> {
        match self {
            Self::Present | Self::Children { .. } => None,
            Self::Text(text) if text == actual => None,
            Self::Number(n) => match actual.trim().parse::<f64>() {
                Ok(parsed) if parsed == *n => None,
                _ => Some(quote(actual)),
            },
            Self::Text(_) => Some(quote(actual)),
        }
    }
}

impl fmt::Display for Expected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Present => write!(f, "<present>"),
            Self::Text(text) => write!(f, "{}", quote(text)),
            Self::Number(n) => write!(f, "{}", n),
            Self::Children { children, .. } => write!(f, "<{} children>", children.len()),
        }
    }
}

pub(crate) fn quote(text: &str) -> String {
    format!("{:?}", text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_shapes() {
        let expected = Expected::from_json(&json!({
            "$": "{x:1}",
            "n": 42,
            "s": "hi",
            "flag": true,
            "any": null,
            "arr": [1, 2],
        }))
        .unwrap();

        let Expected::Children { summary, children } = expected else {
            panic!("object must become children");
        };
        assert_eq!(summary.as_deref(), Some("{x:1}"));
        assert_eq!(children.len(), 5);
        assert!(children.contains(&("n".to_string(), Expected::Number(42.0))));
        assert!(children.contains(&("flag".to_string(), Expected::Text("true".to_string()))));
        assert!(children.contains(&("any".to_string(), Expected::Present)));
        assert!(children.contains(&(
            "arr".to_string(),
            Expected::Children {
                summary: None,
                children: vec![
                    ("[0]".to_string(), Expected::Number(1.0)),
                    ("[1]".to_string(), Expected::Number(2.0)),
                ],
            }
        )));
    }

    #[test]
    fn test_summary_must_be_scalar() {
        assert!(Expected::from_json(&json!({ "$": { "nested": 1 } })).is_err());
    }

    #[test]
    fn test_check_value() {
        assert_eq!(Expected::Number(42.0).check_value("42.0"), None);
        assert_eq!(Expected::Number(42.0).check_value(" 42 "), None);
        assert!(Expected::Number(42.0).check_value("42.5").is_some());
        assert!(Expected::Number(1.0).check_value("true").is_some());
        assert_eq!(Expected::Text("x".into()).check_value("x"), None);
        assert_eq!(Expected::Text("x".into()).check_value("y"), Some("\"y\"".to_string()));
        assert_eq!(Expected::Present.check_value("anything"), None);
    }
}
