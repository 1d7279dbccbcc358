//! Minimal dollar-rooted JSON path resolver for body operators.
//!
//! Supports dotted fields (`$.a.b`), array indices (`$.items[0].id`) and the
//! first-match wildcard (`$.items[*].id`). A missing key resolves to
//! [`JsonPathError::UnknownKey`] so that `empty`/`not_empty` operators stay
//! meaningful; malformed expressions are reported separately.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JsonPathError {
    #[error("unknown key {0}")]
    UnknownKey(String),

    #[error("invalid json path: {0}")]
    Syntax(String),
}

/// Resolves a dollar-rooted path against a JSON document.
pub fn resolve(root: &Value, path: &str) -> Result<Value, JsonPathError> {
    let rest = path
        .strip_prefix('$')
        .ok_or_else(|| JsonPathError::Syntax(format!("path must start with $: {path}")))?;

    let rest = rest.strip_prefix('.').unwrap_or(rest);
    navigate(root, rest).cloned()
}

fn navigate<'a>(value: &'a Value, path: &str) -> Result<&'a Value, JsonPathError> {
    if path.is_empty() {
        return Ok(value);
    }

    if let Some(rest) = path.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| JsonPathError::Syntax(format!("unclosed bracket in {path}")))?;

        let index = &rest[..end];
        let tail = rest[end + 1..].trim_start_matches('.');

        let items = match value {
            Value::Array(items) => items,
            _ => return Err(JsonPathError::UnknownKey(format!("[{index}]"))),
        };

        if index == "*" {
            // First element for which the remaining path resolves
            for item in items {
                if let Ok(found) = navigate(item, tail) {
                    return Ok(found);
                }
            }

            return Err(JsonPathError::UnknownKey("[*]".to_string()));
        }

        let index: usize = index
            .parse()
            .map_err(|_| JsonPathError::Syntax(format!("invalid index [{index}]")))?;

        let item = items
            .get(index)
            .ok_or_else(|| JsonPathError::UnknownKey(format!("[{index}]")))?;

        return navigate(item, tail);
    }

    let (segment, tail) = split_segment(path);
    if segment.is_empty() {
        return Err(JsonPathError::Syntax(format!("empty segment in {path}")));
    }

    match value {
        Value::Object(map) => {
            let next = map
                .get(segment)
                .ok_or_else(|| JsonPathError::UnknownKey(segment.to_string()))?;
            navigate(next, tail)
        }
        _ => Err(JsonPathError::UnknownKey(segment.to_string())),
    }
}

fn split_segment(path: &str) -> (&str, &str) {
    let dot = path.find('.');
    let bracket = path.find('[');

    match (dot, bracket) {
        (Some(d), Some(b)) if b < d => (&path[..b], &path[b..]),
        (Some(d), _) => (&path[..d], &path[d + 1..]),
        (None, Some(b)) => (&path[..b], &path[b..]),
        (None, None) => (path, ""),
    }
}
