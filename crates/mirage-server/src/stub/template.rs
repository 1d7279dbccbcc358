//! Response templating over request data.
//!
//! A template script is plain text with `{{ ... }}` actions. Actions resolve
//! accessors against the incoming request (`.Request.*`, `.Grpc.*`,
//! `JSONBody.*`) and may pipe the value through helpers for string
//! manipulation, encoding, time and integer math:
//!
//! ```yaml
//! status_code: 200
//! body: '{"name": "{{ JSONBody.user.name | upper }}", "at": "{{ now }}"}'
//! ```
//!
//! The rendered document is parsed as a [`ResponseScript`] in YAML (default)
//! or JSON and merged over the stub response.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::error;

use crate::capture::{CapturedRequest, GrpcRequest};

use super::response::{Cookie, Response, ResponseError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    Json,
    #[default]
    Yaml,
}

/// Response template settings stored on a stub.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Template {
    /// Schema of the rendered script. Default is yaml.
    #[serde(default)]
    pub script_schema_type: SchemaType,

    /// Template source. See [`ResponseScript`] for the rendered structure.
    #[serde(default)]
    pub script: String,
}

/// The structure a template renders to; undefined fields leave the base
/// response unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseScript {
    #[serde(default)]
    pub status_code: i32,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub cookies: Vec<Cookie>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub error: Option<ResponseError>,
}

impl ResponseScript {
    pub fn assign_to(&self, response: &mut Response) {
        if self.status_code > 0 {
            response.status_code = self.status_code;
        }

        if !self.body.is_empty() {
            response.body = self.body.as_str().into();
        }

        response.cookies.extend(self.cookies.iter().cloned());

        if self.error.is_some() {
            response.error = self.error.clone();
        }

        for (k, v) in &self.headers {
            response.header.insert(k.clone(), v.clone());
        }
    }
}

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("cannot parse script: {0}")]
    Parse(String),

    #[error("cannot evaluate {expr}: {reason}")]
    Eval { expr: String, reason: String },

    #[error("rendered script is not a valid response script: {0}")]
    Script(String),
}

/// Data available to a template. Either HTTP or gRPC is populated.
pub struct TemplateData<'a> {
    pub request: Option<&'a CapturedRequest>,
    pub grpc: Option<&'a GrpcRequest>,
    parsed_body: OnceCell<Value>,
}

impl<'a> TemplateData<'a> {
    pub fn for_http(request: &'a CapturedRequest) -> Self {
        Self {
            request: Some(request),
            grpc: None,
            parsed_body: OnceCell::new(),
        }
    }

    pub fn for_grpc(grpc: &'a GrpcRequest) -> Self {
        Self {
            request: None,
            grpc: Some(grpc),
            parsed_body: OnceCell::new(),
        }
    }

    /// Parses the request body (or the gRPC input message) into JSON.
    /// A decode failure is fatal to the render.
    fn json_body(&self) -> Result<&Value, String> {
        if let Some(grpc) = self.grpc {
            return Ok(self
                .parsed_body
                .get_or_init(|| Value::Object(grpc.input_data.clone())));
        }

        let request = self.request.ok_or("no request data available")?;
        if let Some(parsed) = self.parsed_body.get() {
            return Ok(parsed);
        }

        let parsed: Value = serde_json::from_slice(&request.body)
            .map_err(|e| format!("cannot decode json body: {e}"))?;
        Ok(self.parsed_body.get_or_init(|| parsed))
    }
}

impl Template {
    /// Renders the template and parses the output per the schema type.
    pub fn execute(&self, data: &TemplateData) -> Result<ResponseScript, TemplateError> {
        let rendered = render(&self.script, data)?;

        match self.script_schema_type {
            SchemaType::Json => serde_json::from_str(&rendered).map_err(|e| {
                error!("cannot parse rendered script: {e}");
                TemplateError::Script(e.to_string())
            }),
            SchemaType::Yaml => serde_yaml::from_str(&rendered).map_err(|e| {
                error!("cannot parse rendered script: {e}");
                TemplateError::Script(e.to_string())
            }),
        }
    }
}

fn render(script: &str, data: &TemplateData) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(script.len());
    let mut rest = script;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| TemplateError::Parse(format!("unclosed action near {}", &rest[start..])))?;

        let expr = after[..end].trim();
        let value = evaluate(expr, data)?;
        out.push_str(&render_value(&value));
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    Ok(out)
}

fn evaluate(expr: &str, data: &TemplateData) -> Result<Value, TemplateError> {
    let mut stages = expr.split('|').map(str::trim);
    let head = stages
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| TemplateError::Parse(format!("empty action in {expr}")))?;

    let mut value = resolve_head(head, data).map_err(|reason| TemplateError::Eval {
        expr: expr.to_string(),
        reason,
    })?;

    for stage in stages {
        value = apply_helper(stage, value).map_err(|reason| TemplateError::Eval {
            expr: expr.to_string(),
            reason,
        })?;
    }

    Ok(value)
}

fn resolve_head(head: &str, data: &TemplateData) -> Result<Value, String> {
    if let Some(literal) = parse_literal(head) {
        return Ok(literal);
    }

    match head {
        "now" => return Ok(Value::String(Utc::now().to_rfc3339())),
        "unix" => return Ok(Value::from(Utc::now().timestamp())),
        _ => {}
    }

    if head == "JSONBody" {
        return data.json_body().cloned();
    }

    if let Some(path) = head.strip_prefix("JSONBody.") {
        return Ok(lookup_path(data.json_body()?, path));
    }

    if let Some(rest) = head.strip_prefix(".Request.") {
        let request = data.request.ok_or("no request data available")?;
        return resolve_request_field(request, rest);
    }

    if let Some(rest) = head.strip_prefix(".Grpc.") {
        let grpc = data.grpc.ok_or("no grpc data available")?;
        if rest == "FullMethod" {
            return Ok(Value::String(grpc.full_method.clone()));
        }

        if let Some(path) = rest.strip_prefix("InputData.") {
            return Ok(lookup_path(&Value::Object(grpc.input_data.clone()), path));
        }

        return Err(format!("unknown grpc field {rest}"));
    }

    Err(format!("unknown accessor {head}"))
}

fn resolve_request_field(request: &CapturedRequest, field: &str) -> Result<Value, String> {
    match field {
        "Method" => return Ok(Value::String(request.method.clone())),
        "URL" => return Ok(Value::String(request.url.clone())),
        "Path" => return Ok(Value::String(request.path.clone())),
        _ => {}
    }

    if let Some(name) = field.strip_prefix("Header.") {
        return Ok(Value::String(request.header_value(name).unwrap_or_default()));
    }

    if let Some(name) = field.strip_prefix("Query.") {
        return Ok(Value::String(request.query_value(name).unwrap_or_default()));
    }

    if let Some(name) = field.strip_prefix("Cookie.") {
        return Ok(Value::String(request.cookie_value(name).unwrap_or_default()));
    }

    Err(format!("unknown request field {field}"))
}

fn lookup_path(root: &Value, path: &str) -> Value {
    let mut current = root;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(next) => current = next,
            None => return Value::Null,
        }
    }

    current.clone()
}

fn parse_literal(token: &str) -> Option<Value> {
    if token.len() >= 2 && token.starts_with('"') && token.ends_with('"') {
        return Some(Value::String(token[1..token.len() - 1].to_string()));
    }

    token.parse::<i64>().ok().map(Value::from)
}

fn apply_helper(stage: &str, value: Value) -> Result<Value, String> {
    let (name, arg) = match stage.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, Some(arg.trim())),
        None => (stage, None),
    };

    let arg_value = arg.map(|a| parse_literal(a).ok_or(format!("invalid argument {a}")));

    match name {
        "upper" => Ok(Value::String(as_string(&value).to_uppercase())),
        "lower" => Ok(Value::String(as_string(&value).to_lowercase())),
        "trim" => Ok(Value::String(as_string(&value).trim().to_string())),
        "title" => Ok(Value::String(title_case(&as_string(&value)))),
        "b64enc" => Ok(Value::String(BASE64.encode(as_string(&value)))),
        "b64dec" => {
            let decoded = BASE64
                .decode(as_string(&value))
                .map_err(|e| format!("invalid base64: {e}"))?;
            String::from_utf8(decoded)
                .map(Value::String)
                .map_err(|e| format!("decoded value is not utf-8: {e}"))
        }
        "urlquery" => Ok(Value::String(
            url::form_urlencoded::byte_serialize(as_string(&value).as_bytes()).collect(),
        )),
        "len" => match &value {
            Value::String(s) => Ok(Value::from(s.chars().count() as i64)),
            Value::Array(items) => Ok(Value::from(items.len() as i64)),
            Value::Object(map) => Ok(Value::from(map.len() as i64)),
            _ => Err("len expects a string, sequence or map".to_string()),
        },
        "default" => {
            let fallback = arg_value.ok_or("default requires an argument")??;
            if value.is_null() || value.as_str() == Some("") {
                Ok(fallback)
            } else {
                Ok(value)
            }
        }
        "add" | "sub" => {
            let operand = arg_value
                .ok_or(format!("{name} requires an argument"))??
                .as_i64()
                .ok_or(format!("{name} requires an integer argument"))?;
            let base = value
                .as_i64()
                .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
                .ok_or("integer math on a non-integer value")?;
            Ok(Value::from(if name == "add" {
                base + operand
            } else {
                base - operand
            }))
        }
        other => Err(format!("unknown helper {other}")),
    }
}

fn as_string(value: &Value) -> String {
    super::matching::value_to_string(value)
}

fn title_case(s: &str) -> String {
    s.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
