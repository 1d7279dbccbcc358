//! Request capture: normalizes incoming HTTP/gRPC requests into a matchable
//! record and the persisted incoming-request transcript.

use std::collections::HashMap;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::stub::matching::MatchError;
use crate::stub::operator::CONTENT_TYPE_MULTIPART;
use crate::stub::response::Body;

/// Method marker used for captured gRPC calls.
pub const METHOD_GRPC: &str = "grpc";

/// Normalized view of an incoming HTTP request used by the matcher and the
/// template engine. The body is collected once by the handler; JSON parsing
/// happens lazily on first use.
#[derive(Debug)]
pub struct CapturedRequest {
    pub method: String,
    /// Full URL as received: path plus raw query.
    pub url: String,
    pub path: String,
    pub header: HashMap<String, Vec<String>>,
    pub query: Vec<(String, String)>,
    pub cookies: HashMap<String, String>,
    pub content_type: String,
    pub body: Vec<u8>,

    /// Multipart form values, parsed up front by the handler since multipart
    /// decoding is asynchronous.
    pub form: Option<HashMap<String, String>>,
    pub form_error: Option<String>,

    parsed_json: OnceCell<Result<Value, String>>,
}

impl CapturedRequest {
    pub fn new(method: &str, uri: &http::Uri, headers: &http::HeaderMap, body: Vec<u8>) -> Self {
        let mut header: HashMap<String, Vec<String>> = HashMap::new();
        for (name, value) in headers {
            if let Ok(value) = value.to_str() {
                header
                    .entry(name.to_string())
                    .or_default()
                    .push(value.to_string());
            }
        }

        let query = uri
            .query()
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect()
            })
            .unwrap_or_default();

        let cookies = parse_cookies(headers);

        let content_type = headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let url = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| uri.path().to_string());

        Self {
            method: method.to_string(),
            url,
            path: uri.path().to_string(),
            header,
            query,
            cookies,
            content_type,
            body,
            form: None,
            form_error: None,
            parsed_json: OnceCell::new(),
        }
    }

    #[cfg(test)]
    pub fn for_test(method: &str, url: &str, headers: Vec<(&str, &str)>, body: Vec<u8>) -> Self {
        let uri: http::Uri = url.parse().expect("test uri");
        let mut map = http::HeaderMap::new();
        for (k, v) in headers {
            map.append(
                http::header::HeaderName::from_bytes(k.as_bytes()).expect("test header name"),
                v.parse().expect("test header value"),
            );
        }

        Self::new(method, &uri, &map, body)
    }

    /// First value of a header, looked up case-insensitively.
    pub fn header_value(&self, name: &str) -> Option<String> {
        self.header
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, values)| values.first().cloned())
    }

    /// First value of a query parameter.
    pub fn query_value(&self, name: &str) -> Option<String> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
    }

    pub fn cookie_value(&self, name: &str) -> Option<String> {
        self.cookies.get(name).cloned()
    }

    /// Parses the body as JSON once; repeated calls reuse the result.
    pub fn json_body(&self) -> Result<&Value, MatchError> {
        let parsed = self.parsed_json.get_or_init(|| {
            if self.body.is_empty() {
                return Ok(Value::Object(serde_json::Map::new()));
            }

            serde_json::from_slice(&self.body).map_err(|e| e.to_string())
        });

        match parsed {
            Ok(value) => Ok(value),
            Err(e) => Err(MatchError::Body(e.clone())),
        }
    }

    /// Form value by key for multipart and url-encoded bodies.
    pub fn form_value(&self, key: &str) -> Result<Value, MatchError> {
        if self.content_type.starts_with(CONTENT_TYPE_MULTIPART) {
            if let Some(error) = &self.form_error {
                return Err(MatchError::Body(error.clone()));
            }

            let form = self
                .form
                .as_ref()
                .ok_or_else(|| MatchError::Body("multipart form not parsed".to_string()))?;

            return Ok(Value::String(form.get(key).cloned().unwrap_or_default()));
        }

        let value = url::form_urlencoded::parse(&self.body)
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
            .unwrap_or_default();

        Ok(Value::String(value))
    }

    fn is_multipart(&self) -> bool {
        self.content_type
            .to_ascii_lowercase()
            .starts_with(CONTENT_TYPE_MULTIPART)
    }
}

fn parse_cookies(headers: &http::HeaderMap) -> HashMap<String, String> {
    let mut cookies = HashMap::new();
    for value in headers.get_all(http::header::COOKIE) {
        if let Ok(raw) = value.to_str() {
            for pair in raw.split(';') {
                if let Some((name, value)) = pair.trim().split_once('=') {
                    cookies.insert(name.trim().to_string(), value.trim().to_string());
                }
            }
        }
    }

    cookies
}

/// gRPC request view handed to the matcher and the template engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrpcRequest {
    pub full_method: String,
    pub input_data: serde_json::Map<String, Value>,
}

/// Persisted transcript of a served request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IncomingRequest {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub tag: String,
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub header: HashMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Body::is_empty")]
    pub body: Body,
    #[serde(default)]
    pub curl: String,
    #[serde(default)]
    pub stub_id: i64,
}

impl IncomingRequest {
    /// Captures an HTTP request for persistence. The body is skipped for
    /// multipart payloads and for bodies over the threshold (0 = unlimited);
    /// the cURL transcript then drops its `-d` argument.
    pub fn capture(request: &CapturedRequest, namespace: &str, body_threshold: usize) -> Self {
        let mut save_body = !request.is_multipart() && !request.body.is_empty();
        if save_body && body_threshold > 0 && request.body.len() > body_threshold {
            info!("body is too large, skip persisting ({} bytes)", request.body.len());
            save_body = false;
        }

        Self {
            id: 0,
            namespace: namespace.to_string(),
            tag: String::new(),
            url: request.url.clone(),
            method: request.method.clone(),
            header: request.header.clone(),
            body: if save_body {
                Body(request.body.clone())
            } else {
                Body::default()
            },
            curl: build_curl(request, save_body),
            stub_id: 0,
        }
    }

    /// Captures a gRPC call. The decoded input message is always persisted:
    /// gRPC bodies are structured and bounded.
    pub fn capture_grpc(
        full_method: &str,
        metadata: HashMap<String, Vec<String>>,
        input_json: Vec<u8>,
    ) -> Self {
        Self {
            id: 0,
            namespace: String::new(),
            tag: String::new(),
            url: full_method.to_string(),
            method: METHOD_GRPC.to_string(),
            header: metadata,
            body: Body(input_json),
            curl: String::new(),
            stub_id: 0,
        }
    }

    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }
}

fn build_curl(request: &CapturedRequest, include_body: bool) -> String {
    let mut parts = vec![format!("curl -X '{}'", request.method)];

    let mut names: Vec<&String> = request.header.keys().collect();
    names.sort();
    for name in names {
        for value in &request.header[name] {
            parts.push(format!("-H '{name}: {value}'"));
        }
    }

    if include_body && !request.body.is_empty() {
        let body = String::from_utf8_lossy(&request.body).replace('\'', "'\\''");
        parts.push(format!("-d '{body}'"));
    }

    parts.push(format!("'{}'", request.url));
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn json_request(body: &str) -> CapturedRequest {
        CapturedRequest::for_test(
            "POST",
            "/echo/animal/create?search_term=S1&search_term=S2",
            vec![
                ("Content-Type", "application/json"),
                ("X-Request-Id", "R1"),
                ("Cookie", "SESSION_ID=X1; OTHER=O1"),
            ],
            body.as_bytes().to_vec(),
        )
    }

    #[test]
    fn test_captured_request_fields() {
        let r = json_request("{}");
        assert_eq!(r.method, "POST");
        assert_eq!(r.url, "/echo/animal/create?search_term=S1&search_term=S2");
        assert_eq!(r.path, "/echo/animal/create");
        assert_eq!(r.query_value("search_term").unwrap(), "S1");
        assert_eq!(r.header_value("x-request-id").unwrap(), "R1");
        assert_eq!(r.cookie_value("SESSION_ID").unwrap(), "X1");
        assert_eq!(r.cookie_value("OTHER").unwrap(), "O1");
        assert!(r.cookie_value("MISSING").is_none());
    }

    #[test]
    fn test_json_body_parses_once() {
        let r = json_request(r#"{"key_1": {"key_2": "V1"}}"#);
        let first = r.json_body().unwrap() as *const Value;
        let second = r.json_body().unwrap() as *const Value;
        assert_eq!(first, second);
    }

    #[test]
    fn test_json_body_error_is_sticky() {
        let r = json_request("not json");
        assert!(r.json_body().is_err());
        assert!(r.json_body().is_err());
    }

    #[test]
    fn test_empty_json_body_is_empty_object() {
        let r = json_request("");
        assert_eq!(r.json_body().unwrap(), &serde_json::json!({}));
    }

    #[test]
    fn test_url_encoded_form_value() {
        let r = CapturedRequest::for_test(
            "POST",
            "/echo/form",
            vec![("Content-Type", "application/x-www-form-urlencoded")],
            b"name=alice&age=30".to_vec(),
        );

        assert_eq!(r.form_value("name").unwrap(), serde_json::json!("alice"));
        assert_eq!(r.form_value("missing").unwrap(), serde_json::json!(""));
    }

    #[test]
    fn test_capture_persists_body_and_curl() {
        let r = json_request(r#"{"id":"A1"}"#);
        let captured = IncomingRequest::capture(&r, "ns1", 0);

        assert_eq!(captured.namespace, "ns1");
        assert_eq!(captured.method, "POST");
        assert_eq!(captured.body.as_slice(), br#"{"id":"A1"}"#);
        assert!(captured.curl.contains("-d '{\"id\":\"A1\"}'"));
        assert!(captured.curl.contains("curl -X 'POST'"));
    }

    #[test]
    fn test_capture_skips_large_body() {
        let r = json_request(&"x".repeat(64));
        let captured = IncomingRequest::capture(&r, "", 16);

        assert!(captured.body.is_empty());
        assert!(!captured.curl.contains("-d "));
        assert!(captured.curl.contains("curl -X 'POST'"));
    }

    #[test]
    fn test_capture_skips_multipart_body() {
        let r = CapturedRequest::for_test(
            "POST",
            "/echo/upload",
            vec![("Content-Type", "multipart/form-data; boundary=xyz")],
            b"--xyz--".to_vec(),
        );

        let captured = IncomingRequest::capture(&r, "", 0);
        assert!(captured.body.is_empty());
        assert!(!captured.curl.contains("-d "));
    }

    #[test]
    fn test_capture_grpc() {
        let metadata = HashMap::from([("x-request-id".to_string(), vec!["R1".to_string()])]);
        let captured = IncomingRequest::capture_grpc(
            "/offers.v1.OfferService/ValidateOffer",
            metadata,
            br#"{"request_id":"R1"}"#.to_vec(),
        );

        assert_eq!(captured.method, METHOD_GRPC);
        assert_eq!(captured.url, "/offers.v1.OfferService/ValidateOffer");
        assert_eq!(captured.body.as_slice(), br#"{"request_id":"R1"}"#);
    }
}
