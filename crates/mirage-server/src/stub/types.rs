//! Stub definition, request matching rules and the proto metadata record.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capture::CapturedRequest;

use super::json_path::{self, JsonPathError};
use super::matching::{match_operator, MatchError};
use super::operator::{
    validate_body_ops, validate_field_ops, BodyOperator, FieldOperator, Operator,
    CONTENT_TYPE_FORM, CONTENT_TYPE_JSON, CONTENT_TYPE_MULTIPART,
};
use super::response::Response;

/// Protocol of the incoming requests a stub applies to.
pub const PROTOCOL_HTTP: &str = "http";
pub const PROTOCOL_GRPC: &str = "grpc";

/// Method marker for gRPC stubs.
pub const METHOD_GRPC: &str = "grpc";

/// Tag reserved for stubs synthesized by the proxy recorder.
pub const TAG_RECORDED_STUB: &str = "recorded_stub";

/// Request matching rules. All lists are ANDed; an empty list trivially
/// passes its category.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestMatching {
    /// HTTP method to match; empty matches any. The value `grpc` marks
    /// gRPC-protocol stubs.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,

    /// Rules applied to the full URL (HTTP) or the full method path (gRPC).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub url: Vec<Operator>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub header: Vec<FieldOperator>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cookie: Vec<FieldOperator>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub query: Vec<FieldOperator>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub body: Vec<BodyOperator>,
}

impl RequestMatching {
    pub fn validate(&self) -> Result<(), MatchError> {
        validate_field_ops(&self.header)?;
        validate_field_ops(&self.cookie)?;
        validate_field_ops(&self.query)?;
        validate_body_ops(&self.body)?;
        Ok(())
    }
}

/// Reverse-proxy settings. When `target_url` is set the stub forwards
/// instead of answering from its response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Proxy {
    /// Root url of the target server; the relative path comes from the
    /// incoming request.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_url: String,

    /// Optional fixed path on the target; defaults to the incoming path with
    /// the echo prefix stripped.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_path: String,

    /// Records the upstream response as a new stub when enabled.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub enable_record: bool,
}

/// Per-stub serving settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StubSettings {
    /// Deactivates the stub after it has served a request once.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deactivate_when_matched: bool,

    /// Suspends the response for the duration, to simulate a slow API.
    /// Wire format is integer nanoseconds.
    #[serde(
        default,
        with = "duration_nanos",
        skip_serializing_if = "Duration::is_zero"
    )]
    pub delay_duration: Duration,

    /// Data structure version, managed by the store.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub store_version: i32,
}

fn is_zero(v: &i32) -> bool {
    *v == 0
}

mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(d.as_nanos() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let nanos = u64::deserialize(deserializer)?;
        Ok(Duration::from_nanos(nanos))
    }
}

/// A declarative rule pairing a request matcher with a canned response or a
/// reverse-proxy directive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stub {
    #[serde(default)]
    pub id: i64,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// Opaque namespace isolating tenants or test runs.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    /// Free-form label; `recorded_stub` is reserved for the recorder.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tag: String,

    /// `http` or `grpc`. Defaults to http.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestMatching>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Response>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<Proxy>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub active: bool,

    /// Higher weight wins when several stubs match; ties resolve to the most
    /// recently created stub.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub weight: i32,

    #[serde(default, skip_serializing_if = "settings_is_default")]
    pub settings: StubSettings,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

fn settings_is_default(s: &StubSettings) -> bool {
    *s == StubSettings::default()
}

impl Stub {
    pub fn new() -> Self {
        Self {
            response: Some(Response::new()),
            active: true,
            ..Self::default()
        }
    }

    /// Sets the method and URL matching rules. An empty method matches any.
    pub fn for_method(mut self, method: &str, url_ops: Vec<Operator>) -> Self {
        self.request = Some(RequestMatching {
            method: method.to_string(),
            url: url_ops,
            ..Default::default()
        });

        if self.protocol.is_empty() && method != METHOD_GRPC {
            self.protocol = PROTOCOL_HTTP.to_string();
        }

        self
    }

    /// Matches requests with any method.
    pub fn for_any(self, url_ops: Vec<Operator>) -> Self {
        self.for_method("", url_ops)
    }

    /// Matches gRPC requests; URL operators run against the full method path.
    pub fn for_grpc(mut self, url_ops: Vec<Operator>) -> Self {
        self.protocol = PROTOCOL_GRPC.to_string();
        self.for_method(METHOD_GRPC, url_ops)
    }

    pub fn with_header(mut self, name: &str, operator: Operator) -> Self {
        self.request.get_or_insert_with(Default::default).header.push(FieldOperator {
            field_name: name.to_string(),
            operator,
        });
        self
    }

    pub fn with_cookie(mut self, name: &str, operator: Operator) -> Self {
        self.request.get_or_insert_with(Default::default).cookie.push(FieldOperator {
            field_name: name.to_string(),
            operator,
        });
        self
    }

    pub fn with_query(mut self, name: &str, operator: Operator) -> Self {
        self.request.get_or_insert_with(Default::default).query.push(FieldOperator {
            field_name: name.to_string(),
            operator,
        });
        self
    }

    pub fn with_request_body(mut self, operator: BodyOperator) -> Self {
        self.request.get_or_insert_with(Default::default).body.push(operator);
        self
    }

    pub fn will_return(mut self, response: Response) -> Self {
        self.response = Some(response);
        self
    }

    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tag = tag.to_string();
        self
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = id;
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_weight(mut self, weight: i32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_inactive(mut self) -> Self {
        self.active = false;
        self
    }

    pub fn should_deactivate_when_matched(mut self) -> Self {
        self.settings.deactivate_when_matched = true;
        self
    }

    /// Delays the response to simulate a slow API.
    pub fn should_delay(mut self, d: Duration) -> Self {
        self.settings.delay_duration = d;
        self
    }

    pub fn with_target_url(mut self, url: &str) -> Self {
        self.proxy.get_or_insert_with(Default::default).target_url = url.to_string();
        self
    }

    pub fn with_target_path(mut self, path: &str) -> Self {
        self.proxy.get_or_insert_with(Default::default).target_path = path.to_string();
        self
    }

    pub fn with_enable_record(mut self, v: bool) -> Self {
        self.proxy.get_or_insert_with(Default::default).enable_record = v;
        self
    }

    /// True when the stub forwards to a real upstream.
    pub fn is_reversed(&self) -> bool {
        self.proxy
            .as_ref()
            .map(|p| !p.target_url.is_empty())
            .unwrap_or(false)
    }

    pub fn has_template(&self) -> bool {
        self.response
            .as_ref()
            .and_then(|r| r.template.as_ref())
            .map(|t| !t.script.is_empty())
            .unwrap_or(false)
    }

    /// Returns a non-ok result if the stub definition is invalid.
    pub fn validate(&self) -> Result<(), MatchError> {
        if let Some(request) = &self.request {
            request.validate()?;
        }

        if self.response.is_none() && !self.is_reversed() {
            return Err(MatchError::Invalid(
                "proxy or response must be defined".to_string(),
            ));
        }

        if let Some(response) = &self.response {
            response.validate()?;
        }

        Ok(())
    }

    /// Matches this stub against a captured HTTP request. Categories are
    /// checked in order method, URL, header, cookie, query, body with a
    /// short circuit on the first failure.
    pub fn match_http(&self, r: &CapturedRequest) -> Result<bool, MatchError> {
        let request = match &self.request {
            Some(request) => request,
            None => return Ok(false),
        };

        if !request.method.is_empty() && !request.method.eq_ignore_ascii_case(&r.method) {
            return Ok(false);
        }

        let url = Value::String(r.url.clone());
        for op in &request.url {
            if !match_operator(op, &url)? {
                return Ok(false);
            }
        }

        for op in &request.header {
            let value = Value::String(r.header_value(&op.field_name).unwrap_or_default());
            if !match_operator(&op.operator, &value)? {
                return Ok(false);
            }
        }

        // A missing cookie feeds the operator the empty string so that
        // empty-style rules can still match
        for op in &request.cookie {
            let value = Value::String(r.cookie_value(&op.field_name).unwrap_or_default());
            if !match_operator(&op.operator, &value)? {
                return Ok(false);
            }
        }

        for op in &request.query {
            let value = Value::String(r.query_value(&op.field_name).unwrap_or_default());
            if !match_operator(&op.operator, &value)? {
                return Ok(false);
            }
        }

        match_body(request, r)
    }
}

fn match_body(request: &RequestMatching, r: &CapturedRequest) -> Result<bool, MatchError> {
    if request.body.is_empty() {
        return Ok(true);
    }

    // Each body operator declares a content type; the request must agree
    // with all of them before any value is extracted
    for op in &request.body {
        if !r.content_type.starts_with(op.content_type.as_str()) {
            return Err(MatchError::ContentType {
                request: r.content_type.clone(),
                operator: op.content_type.clone(),
            });
        }
    }

    if r.content_type.starts_with(CONTENT_TYPE_JSON) {
        return match_json_body(request, r);
    }

    if r.content_type.starts_with(CONTENT_TYPE_MULTIPART)
        || r.content_type.starts_with(CONTENT_TYPE_FORM)
    {
        for op in &request.body {
            let value = r.form_value(&op.key_path)?;
            if !match_operator(&op.operator, &value)? {
                return Ok(false);
            }
        }

        return Ok(true);
    }

    Err(MatchError::Body(format!(
        "unsupported content type {}",
        r.content_type
    )))
}

fn match_json_body(request: &RequestMatching, r: &CapturedRequest) -> Result<bool, MatchError> {
    let document = r.json_body()?;

    for op in &request.body {
        let value = match json_path::resolve(document, &op.key_path) {
            Ok(value) => value,
            // A missing key means the value is nil, which keeps
            // empty/not_empty meaningful
            Err(JsonPathError::UnknownKey(_)) => Value::Null,
            Err(e @ JsonPathError::Syntax(_)) => return Err(MatchError::Body(e.to_string())),
        };

        if !match_operator(&op.operator, &value)? {
            return Ok(false);
        }
    }

    Ok(true)
}

/// Metadata record for an uploaded `.proto` bundle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Proto {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub file_id: String,
    /// Full method paths, `/pkg.Service/Method`.
    #[serde(default)]
    pub methods: Vec<String>,
    /// Fully-qualified message names.
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Wire wrapper for stub lists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArrayStubs {
    pub stubs: Vec<Stub>,
}

/// Map-of-lists view used when matching gRPC metadata: the operator must
/// match any one value, or the empty string when the field is absent.
pub fn match_any_string(
    op: &Operator,
    values: &[String],
) -> Result<bool, MatchError> {
    if values.is_empty() {
        return match_operator(op, &Value::String(String::new()));
    }

    for value in values {
        if match_operator(op, &Value::String(value.clone()))? {
            return Ok(true);
        }
    }

    Ok(false)
}
