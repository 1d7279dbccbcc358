//! Response envelope and payload helpers for the Admin API.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use chrono::Utc;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::error;

/// Verdicts reported in the admin envelope.
pub const VERDICT_SUCCESS: &str = "success";
pub const VERDICT_FAILURE: &str = "failure";
pub const VERDICT_MISSING_PARAMETERS: &str = "missing_parameters";
pub const VERDICT_INVALID_PARAMETERS: &str = "invalid_parameters";

/// Builds the `{verdict, message, data, time}` envelope.
pub fn send_json(
    status: StatusCode,
    verdict: &str,
    message: &str,
    data: Value,
) -> Response<Full<Bytes>> {
    let body = json!({
        "verdict": verdict,
        "message": message,
        "data": data,
        "time": Utc::now().to_rfc3339(),
    });

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::from("{}"))))
}

pub fn send_success(message: &str, data: Value) -> Response<Full<Bytes>> {
    send_json(StatusCode::OK, VERDICT_SUCCESS, message, data)
}

/// Internal failures hide the cause behind a correlation id; the detail goes
/// to the log.
pub fn send_error(error_id: &str) -> Response<Full<Bytes>> {
    send_json(
        StatusCode::INTERNAL_SERVER_ERROR,
        VERDICT_FAILURE,
        &format!("Unexpected error. Error ID: {error_id}"),
        json!({}),
    )
}

pub fn not_found() -> Response<Full<Bytes>> {
    send_json(
        StatusCode::NOT_FOUND,
        VERDICT_FAILURE,
        "not found",
        json!({}),
    )
}

/// Parses a request payload as JSON, or as YAML when the content type says
/// so. YAML documents are converted to JSON values; raw string response
/// bodies are pre-encoded so that the byte-oriented body decoder keeps them
/// verbatim.
pub fn parse_payload<T: DeserializeOwned>(content_type: &str, body: &[u8]) -> Result<T, String> {
    let mut value: Value = if content_type.starts_with("application/x-yaml")
        || content_type.starts_with("application/yaml")
        || content_type.starts_with("text/yaml")
    {
        let yaml: serde_yaml::Value =
            serde_yaml::from_slice(body).map_err(|e| format!("invalid yaml: {e}"))?;
        let mut value = serde_json::to_value(yaml).map_err(|e| format!("invalid yaml: {e}"))?;
        encode_raw_bodies(&mut value);
        value
    } else {
        serde_json::from_slice(body).map_err(|e| format!("invalid json: {e}"))?
    };

    if value.is_null() {
        value = json!({});
    }

    serde_json::from_value(value).map_err(|e| {
        error!("cannot bind payload: {e}");
        format!("invalid payload: {e}")
    })
}

/// YAML stubs carry response bodies as raw strings; base64-encode them so
/// they survive the body decoder's base64-first precedence.
fn encode_raw_bodies(value: &mut Value) {
    let stubs = match value.get_mut("stubs").and_then(Value::as_array_mut) {
        Some(stubs) => stubs,
        None => return,
    };

    for stub in stubs {
        if let Some(body) = stub
            .get_mut("response")
            .and_then(|r| r.get_mut("body"))
        {
            if let Value::String(s) = body {
                *body = Value::String(BASE64.encode(s.as_bytes()));
            }
        }
    }
}

/// Decodes stub response bodies from base64 into structured JSON for
/// display, when the response declares a JSON content type.
pub fn decode_stub_bodies(stubs: Value) -> Value {
    let mut stubs = stubs;
    if let Some(items) = stubs.as_array_mut() {
        for stub in items {
            decode_stub_body(stub);
        }
    }

    stubs
}

fn decode_stub_body(stub: &mut Value) {
    let response = match stub.get_mut("response") {
        Some(response) => response,
        None => return,
    };

    let is_json = response
        .get("header")
        .and_then(|h| h.get("Content-Type"))
        .and_then(Value::as_str)
        .map(|ct| ct.contains("application/json"))
        .unwrap_or(false);

    if !is_json {
        return;
    }

    let decoded = response
        .get("body")
        .and_then(Value::as_str)
        .and_then(|b| BASE64.decode(b).ok())
        .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).ok());

    if let Some(decoded) = decoded {
        response["body"] = decoded;
    }
}
