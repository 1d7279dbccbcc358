//! Matching engine applying a single operator to an extracted value.
//!
//! The engine is purely functional and content-type-agnostic; callers perform
//! extraction. Values flow in as loosely typed JSON so the same semantics
//! apply to header strings, query parameters and JSON body fragments.

use serde_json::Value;
use thiserror::Error;

use super::operator::{Operator, OperatorName};
use super::regex_cache;

/// Errors surfaced by the matcher. A mismatch is not an error; errors mean
/// the input or the operator definition was malformed.
#[derive(Debug, Error)]
pub enum MatchError {
    #[error("{0}")]
    Invalid(String),

    #[error("unsupported data type for {operator}: {actual}")]
    UnsupportedType { operator: String, actual: String },

    #[error("cannot decode request body: {0}")]
    Body(String),

    #[error("mismatch request and operator content type {request} - {operator}")]
    ContentType { request: String, operator: String },
}

/// Compares an extracted value against an operator.
pub fn match_operator(op: &Operator, value: &Value) -> Result<bool, MatchError> {
    match op.name {
        OperatorName::EqualTo => execute_equal_to(op, value),
        OperatorName::Contains => execute_contains(op, value),
        OperatorName::NotContains => execute_contains(op, value).map(|found| !found),
        OperatorName::Regex => execute_regex(op, value),
        OperatorName::StartWith => {
            execute_string_pair(op, value, |actual, expected| actual.starts_with(expected))
        }
        OperatorName::EndWith => {
            execute_string_pair(op, value, |actual, expected| actual.ends_with(expected))
        }
        OperatorName::Length => execute_length(op, value),
        OperatorName::Empty => Ok(is_empty(value)),
        OperatorName::NotEmpty => Ok(!is_empty(value)),
    }
}

fn execute_equal_to(op: &Operator, value: &Value) -> Result<bool, MatchError> {
    match &op.value {
        Value::Number(expected) => {
            if let Some(expected) = expected.as_i64() {
                if let Some(actual) = get_i64(value) {
                    return Ok(expected == actual);
                }
            } else if let Some(expected) = expected.as_f64() {
                if let Some(actual) = get_f64(value) {
                    return Ok(expected == actual);
                }
            }
        }

        Value::String(expected) => {
            if let Value::String(actual) = value {
                return Ok(expected == actual);
            }

            return Ok(*expected == value_to_string(value));
        }

        _ => {}
    }

    Ok(op.value == *value)
}

fn execute_contains(op: &Operator, value: &Value) -> Result<bool, MatchError> {
    match value {
        Value::String(actual) => match &op.value {
            Value::String(expected) => Ok(actual.contains(expected.as_str())),
            other => Ok(actual.contains(&value_to_string(other))),
        },

        Value::Array(items) => Ok(items.iter().any(|item| *item == op.value)),

        // Key membership, structural equality on the key
        Value::Object(map) => match &op.value {
            Value::String(key) => Ok(map.contains_key(key)),
            _ => Ok(false),
        },

        other => Err(MatchError::UnsupportedType {
            operator: op.describe(),
            actual: kind_of(other).to_string(),
        }),
    }
}

fn execute_regex(op: &Operator, value: &Value) -> Result<bool, MatchError> {
    let pattern = op.value.as_str().ok_or_else(|| MatchError::UnsupportedType {
        operator: op.describe(),
        actual: kind_of(&op.value).to_string(),
    })?;

    let actual = value.as_str().ok_or_else(|| MatchError::UnsupportedType {
        operator: op.describe(),
        actual: kind_of(value).to_string(),
    })?;

    let compiled = regex_cache::compile(pattern)?;
    Ok(compiled.is_match(actual))
}

fn execute_string_pair(
    op: &Operator,
    value: &Value,
    check: impl Fn(&str, &str) -> bool,
) -> Result<bool, MatchError> {
    let expected = op.value.as_str().ok_or_else(|| MatchError::UnsupportedType {
        operator: op.describe(),
        actual: kind_of(&op.value).to_string(),
    })?;

    let actual = value.as_str().ok_or_else(|| MatchError::UnsupportedType {
        operator: op.describe(),
        actual: kind_of(value).to_string(),
    })?;

    Ok(check(actual, expected))
}

fn execute_length(op: &Operator, value: &Value) -> Result<bool, MatchError> {
    let expected = op.value.as_i64().ok_or_else(|| MatchError::UnsupportedType {
        operator: op.describe(),
        actual: kind_of(&op.value).to_string(),
    })?;

    let actual = match value {
        Value::String(s) => s.chars().count(),
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        other => {
            return Err(MatchError::UnsupportedType {
                operator: op.describe(),
                actual: kind_of(other).to_string(),
            })
        }
    };

    Ok(actual as i64 == expected)
}

/// Zero-ness: nil, zero-length string/sequence/map, or the kind's zero value.
fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
    }
}

fn get_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.parse::<i64>().ok(),
        _ => None,
    }
}

fn get_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

/// Canonical string form used when comparing a string expectation with a
/// non-string actual value.
pub(crate) fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::operator::{
        contains, empty, end_with, equal_to, length, not_contains, not_empty, regex, start_with,
    };
    use serde_json::json;

    #[test]
    fn test_equal_to_strings() {
        assert!(match_operator(&equal_to("V1"), &json!("V1")).unwrap());
        assert!(!match_operator(&equal_to("V1"), &json!("V2")).unwrap());
    }

    #[test]
    fn test_equal_to_string_coerces_actual() {
        assert!(match_operator(&equal_to("15"), &json!(15)).unwrap());
        assert!(match_operator(&equal_to("true"), &json!(true)).unwrap());
    }

    #[test]
    fn test_equal_to_numbers() {
        assert!(match_operator(&equal_to(15), &json!(15)).unwrap());
        assert!(match_operator(&equal_to(15), &json!("15")).unwrap());
        assert!(match_operator(&equal_to(1.5), &json!(1.5)).unwrap());
        assert!(match_operator(&equal_to(1.5), &json!("1.5")).unwrap());
        assert!(!match_operator(&equal_to(15), &json!(16)).unwrap());
    }

    #[test]
    fn test_equal_to_structural() {
        let expected = equal_to(json!({"a": 1, "b": [1, 2]}));
        assert!(match_operator(&expected, &json!({"b": [1, 2], "a": 1})).unwrap());
        assert!(!match_operator(&expected, &json!({"a": 1})).unwrap());
    }

    #[test]
    fn test_contains_string() {
        assert!(match_operator(&contains("animal"), &json!("/echo/animal/create")).unwrap());
        assert!(!match_operator(&contains("plant"), &json!("/echo/animal/create")).unwrap());
    }

    #[test]
    fn test_contains_array_membership() {
        assert!(match_operator(&contains("a"), &json!(["a", "b"])).unwrap());
        assert!(!match_operator(&contains("c"), &json!(["a", "b"])).unwrap());
        assert!(match_operator(&contains(json!({"k": 1})), &json!([{"k": 1}])).unwrap());
    }

    #[test]
    fn test_contains_map_key_membership() {
        assert!(match_operator(&contains("a"), &json!({"a": 1})).unwrap());
        assert!(!match_operator(&contains("b"), &json!({"a": 1})).unwrap());
    }

    #[test]
    fn test_contains_unsupported_kind() {
        assert!(match_operator(&contains("a"), &json!(15)).is_err());
    }

    #[test]
    fn test_not_contains() {
        assert!(!match_operator(&not_contains("a"), &json!(["a"])).unwrap());
        assert!(match_operator(&not_contains("b"), &json!(["a"])).unwrap());
        assert!(match_operator(&not_contains("x"), &json!(42)).is_err());
    }

    #[test]
    fn test_regex() {
        let op = regex("animal/[0-9]{3,7}/create");
        assert!(match_operator(&op, &json!("animal/123456/create")).unwrap());
        assert!(!match_operator(&op, &json!("animal/abcdfg/create")).unwrap());
        assert!(match_operator(&op, &json!(10)).is_err());
        assert!(match_operator(&regex("animal/["), &json!("animal")).is_err());
    }

    #[test]
    fn test_start_end_with() {
        assert!(match_operator(&start_with("/echo"), &json!("/echo/animal")).unwrap());
        assert!(!match_operator(&start_with("/animal"), &json!("/echo/animal")).unwrap());
        assert!(match_operator(&end_with("create"), &json!("animal/create")).unwrap());
        assert!(match_operator(&end_with("create"), &json!(1)).is_err());
    }

    #[test]
    fn test_length() {
        assert!(match_operator(&length(2), &json!("ab")).unwrap());
        assert!(match_operator(&length(2), &json!(["a", "b"])).unwrap());
        assert!(match_operator(&length(1), &json!({"a": 1})).unwrap());
        assert!(!match_operator(&length(3), &json!("ab")).unwrap());
        assert!(match_operator(&length(1), &json!(10)).is_err());
    }

    #[test]
    fn test_empty_not_empty_are_negations() {
        for value in [
            json!(null),
            json!(""),
            json!("x"),
            json!([]),
            json!([1]),
            json!({}),
            json!({"a": 1}),
            json!(0),
            json!(1),
            json!(false),
            json!(true),
        ] {
            let is_empty = match_operator(&empty(), &value).unwrap();
            let is_not_empty = match_operator(&not_empty(), &value).unwrap();
            assert_ne!(is_empty, is_not_empty, "value {value}");
        }
    }

    #[test]
    fn test_empty_semantics() {
        assert!(match_operator(&empty(), &json!(null)).unwrap());
        assert!(match_operator(&empty(), &json!("")).unwrap());
        assert!(match_operator(&empty(), &json!([])).unwrap());
        assert!(match_operator(&empty(), &json!(0)).unwrap());
        assert!(!match_operator(&empty(), &json!("x")).unwrap());
    }
}
