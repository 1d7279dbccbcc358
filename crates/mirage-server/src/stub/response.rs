//! Response model: body encoding, cookies, headers and gRPC error payloads.

use std::collections::HashMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use tracing::{error, info};

use crate::storage::{FileStorage, StorageError};

use super::matching::MatchError;
use super::operator::CONTENT_TYPE_JSON;
use super::template::{Template, TemplateData, TemplateError};

/// Header names used across the handlers.
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
pub const HEADER_LOCATION: &str = "Location";

/// Response cookie. Not applied for gRPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default = "epoch")]
    pub expired_at: DateTime<Utc>,
}

fn epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(0, 0).unwrap()
}

/// Response body bytes with a forgiving wire encoding.
///
/// Clients may submit the body as a base64-encoded JSON string, as base64
/// bytes from a database round-trip, or as an inline JSON value. The decoder
/// tries these in order and falls back to the raw bytes; YAML payloads carry
/// raw strings and are pre-encoded by the admin layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Body(pub Vec<u8>);

impl Body {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&str> for Body {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl Serialize for Body {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Body {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BodyVisitor;

        impl<'de> Visitor<'de> for BodyVisitor {
            type Value = Body;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("base64 string, raw string or inline JSON value")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Body, E> {
                if !v.is_empty() {
                    if let Ok(decoded) = BASE64.decode(v) {
                        return Ok(Body(decoded));
                    }
                }

                Ok(Body(v.as_bytes().to_vec()))
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Body, E> {
                Ok(Body(v.to_vec()))
            }

            fn visit_unit<E: de::Error>(self) -> Result<Body, E> {
                Ok(Body::default())
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<Body, E> {
                Ok(Body(v.to_string().into_bytes()))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Body, E> {
                Ok(Body(v.to_string().into_bytes()))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Body, E> {
                Ok(Body(v.to_string().into_bytes()))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Body, E> {
                Ok(Body(v.to_string().into_bytes()))
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, seq: A) -> Result<Body, A::Error> {
                let value = Value::deserialize(de::value::SeqAccessDeserializer::new(seq))?;
                Ok(Body(value.to_string().into_bytes()))
            }

            fn visit_map<A: de::MapAccess<'de>>(self, map: A) -> Result<Body, A::Error> {
                let value = Value::deserialize(de::value::MapAccessDeserializer::new(map))?;
                Ok(Body(value.to_string().into_bytes()))
            }
        }

        deserializer.deserialize_any(BodyVisitor)
    }
}

/// gRPC response error, equivalent to a rich `google.rpc.Status`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<ErrorDetail>,
}

/// A single error detail carried in the gRPC status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Fully-qualified message type of the detail, e.g. `common.v1.CommonError`.
    /// The proto of this type must be included in an uploaded bundle.
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub type_name: String,

    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub value: serde_json::Map<String, Value>,
}

/// A canned response: status, body (inline, file-backed or templated),
/// cookies and headers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Zero means the protocol default: 200 for HTTP, OK for gRPC.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub status_code: i32,

    #[serde(default, skip_serializing_if = "Body::is_empty")]
    pub body: Body,

    /// Blob-store key; when set the body is loaded at serve time.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub body_file: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cookies: Vec<Cookie>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub header: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<Template>,
}

fn is_zero(v: &i32) -> bool {
    *v == 0
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor for a JSON body.
    pub fn json(body: impl Serialize) -> Self {
        let bytes = serde_json::to_vec(&body).unwrap_or_default();
        Self::new().with_body(CONTENT_TYPE_JSON, bytes)
    }

    /// Convenience constructor for an HTML body.
    pub fn html(html: impl Into<String>) -> Self {
        Self::new().with_body(super::operator::CONTENT_TYPE_HTML, html.into().into_bytes())
    }

    pub fn with_status_code(mut self, status: i32) -> Self {
        self.status_code = status;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.insert(name.into(), value.into());
        self
    }

    pub fn with_body(self, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        let mut r = self.with_header(HEADER_CONTENT_TYPE, content_type);
        r.body = Body::new(body);
        r
    }

    /// Points the body at an uploaded file; the handler downloads it by this
    /// id when serving.
    pub fn with_file_body(mut self, content_type: &str, file_id: impl Into<String>) -> Self {
        self.body_file = file_id.into();
        self.with_header(HEADER_CONTENT_TYPE, content_type)
    }

    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.push(Cookie {
            name: name.into(),
            value: value.into(),
            expired_at: Utc::now() + chrono::Duration::days(1),
        });
        self
    }

    /// Sets a redirect target. Use [`Response::with_status_code`] to customize
    /// the redirect code.
    pub fn with_redirect(self, url: impl Into<String>) -> Self {
        self.with_status_code(307).with_header(HEADER_LOCATION, url)
    }

    pub fn with_error(mut self, message: impl Into<String>, details: Vec<ErrorDetail>) -> Self {
        let error = self.error.get_or_insert_with(ResponseError::default);
        error.message = message.into();
        error.details.extend(details);
        self
    }

    /// Returns a non-ok result if the response definition is invalid.
    pub fn validate(&self) -> Result<(), MatchError> {
        if let Some(error) = &self.error {
            for detail in &error.details {
                if detail.type_name.is_empty() {
                    return Err(MatchError::Invalid("missing type for error".to_string()));
                }
            }
        }

        Ok(())
    }

    /// Replaces the body with the referenced file's content.
    pub async fn load_body_from_file(
        &mut self,
        storage: &dyn FileStorage,
    ) -> Result<(), StorageError> {
        let data = storage.download_file(&self.body_file).await.map_err(|e| {
            error!("cannot download file {}: {e}", self.body_file);
            e
        })?;

        info!("downloaded file {} length {}", self.body_file, data.len());
        self.body = Body(data);
        Ok(())
    }

    /// Executes the response template and merges its output over this
    /// response.
    pub fn load_body_from_template(&mut self, data: &TemplateData) -> Result<(), TemplateError> {
        let template = match &self.template {
            Some(t) if !t.script.is_empty() => t.clone(),
            _ => return Ok(()),
        };

        let script = template.execute(data)?;
        script.assign_to(self);
        Ok(())
    }
}

/// Builds a response model from an upstream HTTP response, used by the
/// recorder. The body is attached by the caller after the stream is drained.
pub fn response_from_upstream(status: u16, headers: &http::HeaderMap) -> Response {
    let mut response = Response::new().with_status_code(status as i32);

    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            if name != http::header::SET_COOKIE {
                response.header.insert(name.to_string(), value.to_string());
            }
        }
    }

    for value in headers.get_all(http::header::SET_COOKIE) {
        if let Ok(raw) = value.to_str() {
            if let Some(cookie) = parse_set_cookie(raw) {
                response.cookies.push(cookie);
            }
        }
    }

    response
}

fn parse_set_cookie(raw: &str) -> Option<Cookie> {
    let mut parts = raw.split(';');
    let (name, value) = parts.next()?.trim().split_once('=')?;

    let mut expired_at = epoch();
    for attr in parts {
        if let Some((key, v)) = attr.trim().split_once('=') {
            if key.eq_ignore_ascii_case("expires") {
                if let Ok(parsed) = DateTime::parse_from_rfc2822(v.trim()) {
                    expired_at = parsed.with_timezone(&Utc);
                }
            }
        }
    }

    Some(Cookie {
        name: name.trim().to_string(),
        value: value.trim().to_string(),
        expired_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_body_decodes_base64_string() {
        let body: Body = serde_json::from_str(r#""eyJpZCI6IkExIn0=""#).unwrap();
        assert_eq!(body.as_slice(), br#"{"id":"A1"}"#);
    }

    #[test]
    fn test_body_accepts_inline_json() {
        let body: Body = serde_json::from_value(json!({"id": "A1"})).unwrap();
        assert_eq!(body.as_slice(), br#"{"id":"A1"}"#);
    }

    #[test]
    fn test_body_falls_back_to_raw_string() {
        let body: Body = serde_json::from_str(r#""hello world""#).unwrap();
        assert_eq!(body.as_slice(), b"hello world");
    }

    #[test]
    fn test_body_round_trip() {
        let original = Body::new(br#"{"id":"A1"}"#.to_vec());
        let encoded = serde_json::to_string(&original).unwrap();
        let decoded: Body = serde_json::from_str(&encoded).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_response_validate_requires_detail_type() {
        let response = Response::new().with_error(
            "boom",
            vec![ErrorDetail {
                type_name: String::new(),
                value: serde_json::Map::new(),
            }],
        );
        assert!(response.validate().is_err());

        let response = Response::new().with_error(
            "boom",
            vec![ErrorDetail {
                type_name: "common.v1.CommonError".to_string(),
                value: serde_json::Map::new(),
            }],
        );
        assert!(response.validate().is_ok());
    }

    #[test]
    fn test_response_builders() {
        let response = Response::json(json!({"id": "A1"}))
            .with_status_code(201)
            .with_cookie("SESSION_ID", "X1");

        assert_eq!(response.status_code, 201);
        assert_eq!(response.header.get(HEADER_CONTENT_TYPE).unwrap(), CONTENT_TYPE_JSON);
        assert_eq!(response.cookies[0].name, "SESSION_ID");
        assert_eq!(response.body.as_slice(), br#"{"id":"A1"}"#);
    }

    #[test]
    fn test_parse_set_cookie() {
        let cookie =
            parse_set_cookie("SESSION_ID=X1; Path=/; Expires=Tue, 01 Jul 2025 10:00:00 GMT")
                .unwrap();
        assert_eq!(cookie.name, "SESSION_ID");
        assert_eq!(cookie.value, "X1");
        assert_eq!(cookie.expired_at.timezone(), Utc);
    }

    #[test]
    fn test_response_from_upstream_collects_cookies() {
        let mut headers = http::HeaderMap::new();
        headers.insert("content-type", "application/json".parse().unwrap());
        headers.append("set-cookie", "A=1".parse().unwrap());
        headers.append("set-cookie", "B=2; Path=/".parse().unwrap());

        let response = response_from_upstream(200, &headers);
        assert_eq!(response.status_code, 200);
        assert_eq!(response.cookies.len(), 2);
        assert!(response.header.contains_key("content-type"));
        assert!(!response.header.contains_key("set-cookie"));
    }
}
