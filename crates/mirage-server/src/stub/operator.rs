//! Operator definitions for request matching.
//!
//! An operator pairs a name from a closed set with an expected value. Field
//! operators bind an operator to a named header/cookie/query field; body
//! operators bind one to a content type and a key path.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::matching::MatchError;

/// Request content types understood by the body matcher.
pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_XML: &str = "text/xml";
pub const CONTENT_TYPE_HTML: &str = "text/html";
pub const CONTENT_TYPE_TEXT: &str = "text/plain";
pub const CONTENT_TYPE_MULTIPART: &str = "multipart/form-data";
pub const CONTENT_TYPE_FORM: &str = "application/x-www-form-urlencoded";

/// The closed set of matching operators.
///
/// Remember to add new variants to [`OperatorName::ALL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorName {
    Contains,
    NotContains,
    Regex,
    EqualTo,
    StartWith,
    EndWith,
    Length,
    Empty,
    NotEmpty,
}

impl OperatorName {
    pub const ALL: [OperatorName; 9] = [
        OperatorName::Contains,
        OperatorName::NotContains,
        OperatorName::Regex,
        OperatorName::EqualTo,
        OperatorName::StartWith,
        OperatorName::EndWith,
        OperatorName::Length,
        OperatorName::Empty,
        OperatorName::NotEmpty,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperatorName::Contains => "contains",
            OperatorName::NotContains => "not_contains",
            OperatorName::Regex => "regex",
            OperatorName::EqualTo => "equal_to",
            OperatorName::StartWith => "start_with",
            OperatorName::EndWith => "end_with",
            OperatorName::Length => "length",
            OperatorName::Empty => "empty",
            OperatorName::NotEmpty => "not_empty",
        }
    }
}

/// Operator name with the expected value the incoming request is compared to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operator {
    pub name: OperatorName,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub value: Value,
}

impl Operator {
    pub fn new(name: OperatorName, value: Value) -> Self {
        Self { name, value }
    }

    pub fn describe(&self) -> String {
        format!("operator {} - value {}", self.name.as_str(), self.value)
    }
}

/// Operator bound to a named field (header, cookie or query parameter).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldOperator {
    pub field_name: String,
    pub operator: Operator,
}

/// Operator bound to a content type and a key path into the request body.
///
/// For `application/json` the key path is a dollar-rooted JSON path; for
/// form content types it is the form field name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BodyOperator {
    pub content_type: String,
    pub operator: Operator,
    pub key_path: String,
}

// ===== Builder functions mirroring the client SDK =====

/// Checks that the actual value contains the given value.
pub fn contains(v: impl Into<Value>) -> Operator {
    Operator::new(OperatorName::Contains, v.into())
}

/// Checks that the actual value does not contain the given value.
pub fn not_contains(v: impl Into<Value>) -> Operator {
    Operator::new(OperatorName::NotContains, v.into())
}

/// Checks that the actual value equals the given value.
/// The engine coerces the actual value to the expected value's kind.
pub fn equal_to(v: impl Into<Value>) -> Operator {
    Operator::new(OperatorName::EqualTo, v.into())
}

/// Checks that the actual value matches the given regular expression.
pub fn regex(pattern: impl Into<String>) -> Operator {
    Operator::new(OperatorName::Regex, Value::String(pattern.into()))
}

/// Checks that the actual string starts with the given prefix.
pub fn start_with(v: impl Into<String>) -> Operator {
    Operator::new(OperatorName::StartWith, Value::String(v.into()))
}

/// Checks that the actual string ends with the given suffix.
pub fn end_with(v: impl Into<String>) -> Operator {
    Operator::new(OperatorName::EndWith, Value::String(v.into()))
}

/// Checks the length of a string, sequence or map.
pub fn length(v: i64) -> Operator {
    Operator::new(OperatorName::Length, Value::from(v))
}

/// Checks that the value is empty (nil, zero-length or zero-valued).
pub fn empty() -> Operator {
    Operator::new(OperatorName::Empty, Value::Null)
}

/// Checks that the value is not empty.
pub fn not_empty() -> Operator {
    Operator::new(OperatorName::NotEmpty, Value::Null)
}

/// Matches the JSON request body at the given dollar-rooted JSON path.
pub fn body_json_path(json_path: impl Into<String>, operator: Operator) -> BodyOperator {
    BodyOperator {
        content_type: CONTENT_TYPE_JSON.to_string(),
        operator,
        key_path: json_path.into(),
    }
}

/// Matches a form value in a multipart request.
pub fn multipart_form(key: impl Into<String>, operator: Operator) -> BodyOperator {
    BodyOperator {
        content_type: CONTENT_TYPE_MULTIPART.to_string(),
        operator,
        key_path: key.into(),
    }
}

/// Matches a form value in a url-encoded request.
pub fn url_encoded_body(key: impl Into<String>, operator: Operator) -> BodyOperator {
    BodyOperator {
        content_type: CONTENT_TYPE_FORM.to_string(),
        operator,
        key_path: key.into(),
    }
}

// ===== Validation =====

pub(crate) fn validate_field_ops(ops: &[FieldOperator]) -> Result<(), MatchError> {
    for op in ops {
        if op.field_name.is_empty() {
            return Err(MatchError::Invalid("missing field name".to_string()));
        }
    }

    Ok(())
}

pub(crate) fn validate_body_ops(ops: &[BodyOperator]) -> Result<(), MatchError> {
    for op in ops {
        if op.key_path.is_empty() {
            return Err(MatchError::Invalid("missing key path".to_string()));
        }

        if op.content_type.is_empty() {
            return Err(MatchError::Invalid("missing content type".to_string()));
        }
    }

    Ok(())
}
