//! End-to-end request lifecycle for the mock (echo) endpoints.

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use tracing::{error, info, warn};

use crate::capture::{CapturedRequest, IncomingRequest};
use crate::storage::FileStorage;
use crate::store::StubStore;
use crate::stub::operator::CONTENT_TYPE_MULTIPART;
use crate::stub::response::Response as StubResponse;
use crate::stub::selector::select_stub;
use crate::stub::template::TemplateData;
use crate::stub::types::Stub;

use super::proxy::{self, HttpClient};

/// Handles mock traffic for one namespace per request.
pub struct MockHandler {
    store: Arc<dyn StubStore>,
    files: Arc<dyn FileStorage>,
    client: HttpClient,

    /// Bodies above this many bytes are not persisted with the capture;
    /// zero disables the limit.
    body_store_threshold: usize,
}

impl MockHandler {
    pub fn new(
        store: Arc<dyn StubStore>,
        files: Arc<dyn FileStorage>,
        client: HttpClient,
        body_store_threshold: usize,
    ) -> Self {
        Self {
            store,
            files,
            client,
            body_store_threshold,
        }
    }

    /// Serves a mock request. The capture is persisted after the exchange
    /// regardless of the outcome.
    pub async fn handle(
        &self,
        namespace: &str,
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes().to_vec(),
            Err(e) => {
                error!("cannot read request body: {e}");
                return Ok(status_response(StatusCode::INTERNAL_SERVER_ERROR));
            }
        };

        let mut captured =
            CapturedRequest::new(parts.method.as_str(), &parts.uri, &parts.headers, body);

        if captured.content_type.starts_with(CONTENT_TYPE_MULTIPART) {
            match parse_multipart_form(&captured.content_type, &captured.body).await {
                Ok(form) => captured.form = Some(form),
                Err(e) => captured.form_error = Some(e),
            }
        }

        let mut incoming =
            IncomingRequest::capture(&captured, namespace, self.body_store_threshold);

        let response = self.serve(namespace, &captured, &mut incoming).await;

        if let Err(e) = self.store.create_incoming_request(incoming).await {
            error!("cannot persist incoming request: {e}");
        }

        Ok(response)
    }

    async fn serve(
        &self,
        namespace: &str,
        captured: &CapturedRequest,
        incoming: &mut IncomingRequest,
    ) -> Response<Full<Bytes>> {
        let stubs = match self.store.get_all(namespace).await {
            Ok(stubs) => stubs,
            Err(e) => {
                error!("cannot load stubs: {e}");
                return status_response(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };

        if stubs.is_empty() {
            info!("no stubs found in '{namespace}'");
            return status_response(StatusCode::NOT_FOUND);
        }

        let total = stubs.len();
        let mut matched = Vec::with_capacity(total);
        for stub in stubs {
            match stub.match_http(captured) {
                Ok(true) => matched.push(stub),
                Ok(false) => {}
                Err(e) => {
                    error!("matcher failed for stub {}: {e}", stub.id);
                    return status_response(StatusCode::INTERNAL_SERVER_ERROR);
                }
            }
        }

        let stub = match select_stub(matched) {
            Some(stub) => stub,
            None => {
                info!("no matched stub found in '{namespace}'");
                return status_response(StatusCode::NOT_FOUND);
            }
        };

        incoming.stub_id = stub.id;
        incoming.tag = stub.tag.clone();
        info!("matched stub {} out of {total} in '{namespace}'", stub.id);

        if stub.settings.deactivate_when_matched {
            info!("deactivate used stub {}", stub.id);
            if let Err(e) = self.store.delete(stub.id).await {
                warn!("cannot deactivate stub {}, ignore: {e}", stub.id);
            }
        }

        if !stub.settings.delay_duration.is_zero() {
            info!("delay response {:?}", stub.settings.delay_duration);
            tokio::time::sleep(stub.settings.delay_duration).await;
        }

        if stub.is_reversed() {
            return proxy::forward(&self.client, self.store.as_ref(), namespace, captured, &stub)
                .await;
        }

        let mut response = match stub.response.clone() {
            Some(response) => response,
            None => {
                error!("stub {} has neither response nor proxy", stub.id);
                return status_response(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };

        match self.materialize(&mut response, captured, &stub).await {
            Ok(()) => write_response(&response),
            Err(status) => status_response(status),
        }
    }

    /// Loads the file-backed body and executes the response template.
    async fn materialize(
        &self,
        response: &mut StubResponse,
        captured: &CapturedRequest,
        stub: &Stub,
    ) -> Result<(), StatusCode> {
        if !response.body_file.is_empty() {
            response
                .load_body_from_file(self.files.as_ref())
                .await
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        }

        if stub.has_template() {
            let data = TemplateData::for_http(captured);
            response.load_body_from_template(&data).map_err(|e| {
                error!("cannot execute template: {e}");
                StatusCode::INTERNAL_SERVER_ERROR
            })?;
        }

        Ok(())
    }
}

async fn parse_multipart_form(
    content_type: &str,
    body: &[u8],
) -> Result<std::collections::HashMap<String, String>, String> {
    let boundary = multer::parse_boundary(content_type).map_err(|e| e.to_string())?;
    let data = Bytes::copy_from_slice(body);
    let stream = futures_util::stream::once(async move { Ok::<Bytes, Infallible>(data) });

    let mut multipart = multer::Multipart::new(stream, boundary);
    let mut form = std::collections::HashMap::new();

    while let Some(field) = multipart.next_field().await.map_err(|e| e.to_string())? {
        let name = match field.name() {
            Some(name) => name.to_string(),
            None => continue,
        };

        if field.file_name().is_some() {
            continue;
        }

        let value = field.text().await.map_err(|e| e.to_string())?;
        form.insert(name, value);
    }

    Ok(form)
}

/// Writes a stub response to the wire: headers first, then cookies, then the
/// status code and body. A zero status code maps to 200.
pub fn write_response(response: &StubResponse) -> Response<Full<Bytes>> {
    let status = if response.status_code == 0 {
        StatusCode::OK
    } else {
        StatusCode::from_u16(response.status_code as u16).unwrap_or(StatusCode::OK)
    };

    let mut builder = Response::builder().status(status);

    for (name, value) in &response.header {
        builder = builder.header(name, value);
    }

    for cookie in &response.cookies {
        let expires = cookie.expired_at.format("%a, %d %b %Y %H:%M:%S GMT");
        builder = builder.header(
            hyper::header::SET_COOKIE,
            format!("{}={}; Expires={expires}", cookie.name, cookie.value),
        );
    }

    builder
        .body(Full::new(Bytes::from(response.body.0.clone())))
        .unwrap_or_else(|_| status_response(StatusCode::INTERNAL_SERVER_ERROR))
}

pub fn status_response(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::response::Cookie;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_write_response_defaults_to_200() {
        let response = write_response(&StubResponse::new());
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_write_response_headers_and_cookies() {
        let mut stub_response = StubResponse::json(serde_json::json!({"id": "A1"}));
        stub_response.status_code = 201;
        stub_response.cookies.push(Cookie {
            name: "SESSION_ID".to_string(),
            value: "X1".to_string(),
            expired_at: Utc.with_ymd_and_hms(2030, 1, 2, 3, 4, 5).unwrap(),
        });

        let response = write_response(&stub_response);
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        let cookie = response.headers().get(hyper::header::SET_COOKIE).unwrap();
        let cookie = cookie.to_str().unwrap();
        assert!(cookie.starts_with("SESSION_ID=X1; Expires=Wed, 02 Jan 2030"));
    }

    #[tokio::test]
    async fn test_parse_multipart_form() {
        let body = concat!(
            "--boundary\r\n",
            "Content-Disposition: form-data; name=\"field1\"\r\n\r\n",
            "value1\r\n",
            "--boundary\r\n",
            "Content-Disposition: form-data; name=\"file1\"; filename=\"f.bin\"\r\n",
            "Content-Type: application/octet-stream\r\n\r\n",
            "binary\r\n",
            "--boundary--\r\n"
        );

        let form = parse_multipart_form("multipart/form-data; boundary=boundary", body.as_bytes())
            .await
            .unwrap();

        assert_eq!(form.get("field1").unwrap(), "value1");
        assert!(!form.contains_key("file1"));
    }
}
