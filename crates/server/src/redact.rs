//! Redaction of diagnostic snapshots before they reach the log.
//!
//! Any key or string array element that mentions a sensitive keyword is
//! replaced, nesting is cut off past a depth limit, and cycles are reported
//! instead of followed. The input is never touched; a fresh value comes back.

use std::collections::HashSet;

use serde::Serialize;
use serde_json::{Map, Value};

pub const REDACTED: &str = "REDACTED";
pub const REDACTED_TOO_DEEP: &str = "REDACTED_TOO_DEEP";
pub const REDACTED_CIRCULAR_REFERENCE: &str = "REDACTED_CIRCULAR_REFERENCE";
pub const DEFAULT_MAX_DEPTH: usize = 5;

const SENSITIVE_KEYWORDS: &[&str] = &[
    "apikey",
    "token",
    "secret",
    "password",
    "kimimoonshotrefreshtoken",
    "auth",
    "key",
    "credential",
    "jwt",
    "session",
    "access",
    "private",
    "oauth",
];

/// What a node looks like one level down
pub enum Shape<N> {
    Scalar(Value),
    Array(Vec<N>),
    Object(Vec<(String, N)>),
}

/// A walkable graph node.
///
/// `identity` must be equal for two handles to the same container so that
/// cycles can be detected; it is ignored for scalars.
pub trait Inspect: Sized {
    fn identity(&self) -> usize;
    fn shape(&self) -> Shape<Self>;
}

impl<'a> Inspect for &'a Value {
    fn identity(&self) -> usize {
        *self as *const Value as usize
    }

    fn shape(&self) -> Shape<Self> {
        match self {
            Value::Array(items) => Shape::Array(items.iter().collect()),
            Value::Object(map) => Shape::Object(map.iter().map(|(k, v)| (k.clone(), v)).collect()),
            scalar => Shape::Scalar((*scalar).clone()),
        }
    }
}

pub fn is_sensitive(text: &str) -> bool {
    let lower = text.to_lowercase();
    SENSITIVE_KEYWORDS.iter().any(|keyword| lower.contains(keyword))
}

pub fn redact<N: Inspect>(root: N) -> Value {
    redact_with_depth(root, DEFAULT_MAX_DEPTH)
}

pub fn redact_with_depth<N: Inspect>(root: N, max_depth: usize) -> Value {
    let mut path = HashSet::new();
    walk(&root, 0, max_depth, &mut path)
}

/// Serialize then redact; serialization failures are logged as a marker.
pub fn redacted<T: Serialize + ?Sized>(value: &T) -> Value {
    match serde_json::to_value(value) {
        Ok(value) => redact(&value),
        Err(e) => Value::from(format!("<unserializable: {e}>")),
    }
}

fn walk<N: Inspect>(node: &N, depth: usize, max_depth: usize, path: &mut HashSet<usize>) -> Value {
    if depth > max_depth {
        return Value::from(REDACTED_TOO_DEEP);
    }
    let shape = match node.shape() {
        Shape::Scalar(value) => return value,
        container => container,
    };

    // Only the current recursion path counts, so shared siblings still render.
    let id = node.identity();
    if !path.insert(id) {
        return Value::from(REDACTED_CIRCULAR_REFERENCE);
    }

    let out = match shape {
        Shape::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| match item.shape() {
                    Shape::Scalar(Value::String(s)) if is_sensitive(&s) => Value::from(REDACTED),
                    Shape::Scalar(value) => value,
                    _ => walk(item, depth + 1, max_depth, path),
                })
                .collect(),
        ),
        Shape::Object(entries) => {
            let mut map = Map::with_capacity(entries.len());
            for (key, child) in &entries {
                let value = if is_sensitive(key) {
                    Value::from(REDACTED)
                } else {
                    match child.shape() {
                        Shape::Scalar(value) => value,
                        _ => walk(child, depth + 1, max_depth, path),
                    }
                };
                map.insert(key.clone(), value);
            }
            Value::Object(map)
        }
        Shape::Scalar(value) => value,
    };

    path.remove(&id);
    out
}
