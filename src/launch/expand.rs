//! Symbolic reference expansion for launch configurations
//!
//! Values may embed `${namespace:name}` tokens. Two namespaces exist:
//! `dbgconfig` refers to another entry of the same document and `env`
//! to the host environment. Strings are rescanned after every pass until
//! no token is left, so a replacement that itself contains tokens is
//! expanded too.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::common::{Error, Result};

/// Mapping from symbolic name to a value that may reference other names
pub type DbgConfigDocument = Map<String, Value>;

/// Upper bound on rescans of a single string
const MAX_PASSES: usize = 64;

/// Where `${env:NAME}` is looked up
#[derive(Debug, Clone)]
enum EnvSource {
    Process,
    Fixed(HashMap<String, String>),
}

/// Expands `${dbgconfig:...}` and `${env:...}` references
#[derive(Debug, Clone)]
pub struct Expander {
    env: EnvSource,
}

impl Default for Expander {
    fn default() -> Self {
        Self::new()
    }
}

impl Expander {
    /// Expander reading `${env:...}` from this process's environment
    pub fn new() -> Self {
        Self {
            env: EnvSource::Process,
        }
    }

    /// Expander with a fixed environment
    pub fn with_env(vars: HashMap<String, String>) -> Self {
        Self {
            env: EnvSource::Fixed(vars),
        }
    }

    /// Resolve every reference in a document against itself
    ///
    /// Fails with `CyclicReference` naming the first symbol found to depend
    /// on itself, or `UndefinedReference` for a name that does not exist.
    pub fn expand(&self, document: &DbgConfigDocument) -> Result<DbgConfigDocument> {
        let mut resolver = Resolver::new(self, document);
        let mut expanded = Map::new();
        for (name, value) in document {
            resolver.stack.push(name.clone());
            let value = resolver.value(value);
            resolver.stack.pop();
            expanded.insert(name.clone(), value?);
        }
        Ok(expanded)
    }

    /// Expand an arbitrary value (usually launch arguments) against a document
    pub fn expand_value(&self, document: &DbgConfigDocument, value: &Value) -> Result<Value> {
        Resolver::new(self, document).value(value)
    }

    /// Expand environment variable values for a process about to be spawned
    pub fn expand_env(&self, vars: &HashMap<String, String>) -> Result<HashMap<String, String>> {
        let empty = DbgConfigDocument::new();
        let mut resolver = Resolver::new(self, &empty);
        vars.iter()
            .map(|(key, value)| Ok((key.clone(), resolver.string(value)?)))
            .collect()
    }

    fn env_var(&self, name: &str) -> Option<String> {
        match &self.env {
            EnvSource::Process => std::env::var(name).ok(),
            EnvSource::Fixed(vars) => vars.get(name).cloned(),
        }
    }
}

/// A `${...}` token found in a string
struct Token<'a> {
    start: usize,
    end: usize,
    body: &'a str,
}

fn next_token(text: &str, from: usize) -> Option<Token<'_>> {
    let mut search = from;
    while let Some(offset) = text[search..].find("${") {
        let start = search + offset;
        let body_start = start + 2;
        match text[body_start..].find(|c: char| c == '}' || c == '{') {
            Some(len) if len > 0 && text[body_start + len..].starts_with('}') => {
                return Some(Token {
                    start,
                    end: body_start + len + 1,
                    body: &text[body_start..body_start + len],
                });
            }
            Some(_) => search = body_start,
            None => return None,
        }
    }
    None
}

/// Text used when a referenced value is spliced into a string
fn string_form(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

struct Resolver<'a> {
    expander: &'a Expander,
    document: &'a DbgConfigDocument,
    /// Fully expanded string forms of dbgconfig entries
    resolved: HashMap<String, String>,
    /// Entries currently being expanded
    stack: Vec<String>,
}

impl<'a> Resolver<'a> {
    fn new(expander: &'a Expander, document: &'a DbgConfigDocument) -> Self {
        Self {
            expander,
            document,
            resolved: HashMap::new(),
            stack: Vec::new(),
        }
    }

    fn value(&mut self, value: &Value) -> Result<Value> {
        match value {
            Value::String(s) => Ok(Value::String(self.string(s)?)),
            Value::Array(items) => items
                .iter()
                .map(|item| self.value(item))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = Map::new();
                for (key, item) in map {
                    out.insert(key.clone(), self.value(item)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    fn string(&mut self, text: &str) -> Result<String> {
        let mut current = text.to_string();
        let mut last_token = String::new();

        for _ in 0..MAX_PASSES {
            let mut out = String::with_capacity(current.len());
            let mut cursor = 0;
            let mut replaced = false;

            while let Some(token) = next_token(&current, cursor) {
                out.push_str(&current[cursor..token.start]);
                out.push_str(&self.lookup(token.body)?);
                last_token = token.body.to_string();
                cursor = token.end;
                replaced = true;
            }

            if !replaced {
                return Ok(current);
            }
            out.push_str(&current[cursor..]);
            current = out;
        }

        Err(Error::CyclicReference(last_token))
    }

    fn lookup(&mut self, body: &str) -> Result<String> {
        match body.split_once(':') {
            Some(("dbgconfig", name)) => self.definition(name),
            Some(("env", name)) => self
                .expander
                .env_var(name)
                .ok_or_else(|| Error::UndefinedReference(body.to_string())),
            _ => Err(Error::UndefinedReference(body.to_string())),
        }
    }

    fn definition(&mut self, name: &str) -> Result<String> {
        if let Some(done) = self.resolved.get(name) {
            return Ok(done.clone());
        }
        if self.stack.iter().any(|n| n == name) {
            return Err(Error::CyclicReference(format!("dbgconfig:{}", name)));
        }
        let raw = self
            .document
            .get(name)
            .ok_or_else(|| Error::UndefinedReference(format!("dbgconfig:{}", name)))?;

        self.stack.push(name.to_string());
        let expanded = self.value(raw);
        self.stack.pop();

        let text = string_form(&expanded?);
        self.resolved.insert(name.to_string(), text.clone());
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> DbgConfigDocument {
        match value {
            Value::Object(map) => map,
            _ => panic!("test document must be an object"),
        }
    }

    fn expander() -> Expander {
        Expander::with_env(HashMap::from([
            ("HOME".to_string(), "/home/dev".to_string()),
            ("INDIRECT".to_string(), "${dbgconfig:root}".to_string()),
        ]))
    }

    #[test]
    fn test_chained_references() {
        let document = doc(json!({
            "root": "${env:HOME}/src",
            "build": "${dbgconfig:root}/target",
            "program": "${dbgconfig:build}/debug/app",
        }));

        let expanded = expander().expand(&document).unwrap();
        assert_eq!(expanded["program"], "/home/dev/src/target/debug/app");
        assert_eq!(expanded["build"], "/home/dev/src/target");
    }

    #[test]
    fn test_expand_is_idempotent() {
        let document = doc(json!({
            "a": "${dbgconfig:b}-x",
            "b": "plain",
            "n": 3,
        }));

        let once = expander().expand(&document).unwrap();
        let twice = expander().expand(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_mutual_reference_is_cyclic() {
        let document = doc(json!({
            "a": "${dbgconfig:b}",
            "b": "${dbgconfig:a}",
        }));

        let err = expander().expand(&document).unwrap_err();
        assert!(matches!(err, Error::CyclicReference(ref name) if name == "dbgconfig:a"));
    }

    #[test]
    fn test_self_reference_is_cyclic() {
        let document = doc(json!({ "a": "x${dbgconfig:a}" }));
        assert!(matches!(
            expander().expand(&document),
            Err(Error::CyclicReference(_))
        ));
    }

    #[test]
    fn test_undefined_reference_names_symbol() {
        let document = doc(json!({ "a": "${dbgconfig:missing}" }));
        let err = expander().expand(&document).unwrap_err();
        assert!(matches!(err, Error::UndefinedReference(ref name) if name == "dbgconfig:missing"));

        let document = doc(json!({ "a": "${workspaceFolder}" }));
        assert!(matches!(
            expander().expand(&document),
            Err(Error::UndefinedReference(_))
        ));
    }

    #[test]
    fn test_non_string_values_pass_through() {
        let document = doc(json!({
            "port": 4711,
            "flags": [true, null, "${dbgconfig:port}"],
            "nested": { "deep": { "path": "${env:HOME}" } },
        }));

        let expanded = expander().expand(&document).unwrap();
        assert_eq!(expanded["port"], 4711);
        assert_eq!(expanded["flags"], json!([true, null, "4711"]));
        assert_eq!(expanded["nested"]["deep"]["path"], "/home/dev");
    }

    #[test]
    fn test_replacement_is_rescanned() {
        let document = doc(json!({ "root": "/r", "b": "${env:INDIRECT}/x" }));
        let expanded = expander().expand(&document).unwrap();
        assert_eq!(expanded["b"], "/r/x");
    }

    #[test]
    fn test_expand_value_against_document() {
        let document = doc(json!({ "exe": "${env:HOME}/bin/app" }));
        let launch = json!({ "program": "${dbgconfig:exe}", "args": ["--verbose"] });

        let resolved = expander().expand_value(&document, &launch).unwrap();
        assert_eq!(resolved["program"], "/home/dev/bin/app");
        assert_eq!(resolved["args"], json!(["--verbose"]));
    }

    #[test]
    fn test_expand_env_map() {
        let vars = HashMap::from([("PATH_EXTRA".to_string(), "${env:HOME}/bin".to_string())]);
        let expanded = expander().expand_env(&vars).unwrap();
        assert_eq!(expanded["PATH_EXTRA"], "/home/dev/bin");
    }

    #[test]
    fn test_literal_dollar_is_kept() {
        let document = doc(json!({ "price": "$5 and ${ unterminated", "brace": "${a{b}" }));
        let expanded = expander().expand(&document).unwrap();
        assert_eq!(expanded["price"], "$5 and ${ unterminated");
        assert_eq!(expanded["brace"], "${a{b}");
    }
}
