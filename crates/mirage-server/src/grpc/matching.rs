//! Stub matching for captured gRPC calls.

use std::collections::HashMap;

use serde_json::Value;

use crate::capture::GrpcRequest;
use crate::stub::json_path::{self, JsonPathError};
use crate::stub::matching::{match_operator, MatchError};
use crate::stub::types::{match_any_string, Stub, METHOD_GRPC};

/// Matches a stub against a gRPC call: the URL operators run over the full
/// method path, header operators over the request metadata, and body
/// operators over the decoded input message.
pub fn match_grpc(
    stub: &Stub,
    request: &GrpcRequest,
    metadata: &HashMap<String, Vec<String>>,
) -> Result<bool, MatchError> {
    let matching = match &stub.request {
        Some(matching) if matching.method == METHOD_GRPC => matching,
        _ => return Ok(false),
    };

    let full_method = Value::String(request.full_method.clone());
    for op in &matching.url {
        if !match_operator(op, &full_method)? {
            return Ok(false);
        }
    }

    // Metadata keys are transmitted lowercase
    static EMPTY: Vec<String> = Vec::new();
    for op in &matching.header {
        let values = metadata
            .get(&op.field_name.to_lowercase())
            .unwrap_or(&EMPTY);
        if !match_any_string(&op.operator, values)? {
            return Ok(false);
        }
    }

    if matching.body.is_empty() {
        return Ok(true);
    }

    let input = Value::Object(request.input_data.clone());
    for op in &matching.body {
        let value = match json_path::resolve(&input, &op.key_path) {
            Ok(value) => value,
            Err(JsonPathError::UnknownKey(_)) => Value::Null,
            Err(e @ JsonPathError::Syntax(_)) => return Err(MatchError::Body(e.to_string())),
        };

        if !match_operator(&op.operator, &value)? {
            return Ok(false);
        }
    }

    Ok(true)
}
