//! Structured single-field edits
//!
//! An edit names one existing leaf of a payload by its coordinates (object
//! keys and array indices) and replaces its value. The base payload is never
//! touched: `apply` returns a modified copy. Every coordinate must already
//! exist in the base, so an out-of-range index is rejected before anything
//! is written.

use bookmill_common::config::ValueDomains;
use bookmill_common::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// One coordinate step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Index(i) => write!(f, "[{}]", i),
            PathSegment::Key(k) => write!(f, ".{}", k),
        }
    }
}

/// Coordinates of one field, e.g. `groups[2].group_type`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldPath(pub Vec<PathSegment>);

impl FieldPath {
    pub fn new(segments: Vec<PathSegment>) -> Self {
        Self(segments)
    }

    /// Name of the edited field when the last coordinate is a key
    pub fn field_name(&self) -> Option<&str> {
        match self.0.last() {
            Some(PathSegment::Key(k)) => Some(k),
            _ => None,
        }
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("$")?;
        for segment in &self.0 {
            write!(f, "{}", segment)?;
        }
        Ok(())
    }
}

/// Replace the value at `path`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldEdit {
    pub path: FieldPath,
    pub value: Value,
}

impl FieldEdit {
    pub fn new(path: FieldPath, value: Value) -> Self {
        Self { path, value }
    }

    /// Check the new value against the configured enumerations
    pub fn validate_value(&self, domains: &ValueDomains) -> Result<()> {
        match self.path.field_name() {
            Some(field) => domains.validate(field, &self.value),
            None => Ok(()),
        }
    }

    /// Clone `base` and replace the addressed field in the copy
    pub fn apply(&self, base: &Value) -> Result<Value> {
        if self.path.0.is_empty() {
            return Err(Error::InvalidInput(
                "edit path must name at least one field".to_string(),
            ));
        }

        let mut copy = base.clone();
        let mut cursor = &mut copy;
        let mut walked = FieldPath(Vec::with_capacity(self.path.0.len()));

        for segment in &self.path.0 {
            walked.0.push(segment.clone());
            cursor = match (segment, cursor) {
                (PathSegment::Key(key), Value::Object(map)) => map.get_mut(key).ok_or_else(|| {
                    Error::InvalidInput(format!("no field at {}", walked))
                })?,
                (PathSegment::Index(index), Value::Array(items)) => {
                    let len = items.len();
                    items.get_mut(*index).ok_or_else(|| {
                        Error::InvalidInput(format!(
                            "index out of range at {} (length {})",
                            walked, len
                        ))
                    })?
                }
                (_, other) => {
                    return Err(Error::InvalidInput(format!(
                        "cannot step into {} at {}",
                        json_type(other),
                        walked
                    )))
                }
            };
        }

        *cursor = self.value.clone();
        Ok(copy)
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
