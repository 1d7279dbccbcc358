//! Reverse proxy with optional response recording.
//!
//! The mock forwards to upstreams with TLS verification disabled: this is a
//! test tool and remotes are routinely self-signed.

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::DigitallySignedStruct;
use tracing::{error, info};

use crate::capture::CapturedRequest;
use crate::store::StubStore;
use crate::stub::response::{response_from_upstream, Body};
use crate::stub::types::{Proxy, Stub, TAG_RECORDED_STUB};

use super::handler::status_response;

/// Shared client for upstream calls, HTTP/1.1 with default idle pooling.
pub type HttpClient =
    Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>;

/// No-op certificate verifier; upstream certificates are never checked.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::RSA_PSS_SHA256,
        ]
    }
}

/// Builds the shared upstream client.
pub fn create_http_client() -> HttpClient {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let mut http_connector = HttpConnector::new();
    http_connector.enforce_http(false);

    let tls = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
        .with_no_client_auth();

    let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls)
        .https_or_http()
        .enable_http1()
        .wrap_connector(http_connector);

    Client::builder(TokioExecutor::new()).build(https_connector)
}

/// Forwards a matched request to the stub's target and relays the answer.
/// With recording enabled, the upstream response is persisted as a new stub;
/// a recorder failure is logged and the response still flows to the client.
pub async fn forward(
    client: &HttpClient,
    store: &dyn StubStore,
    namespace: &str,
    captured: &CapturedRequest,
    stub: &Stub,
) -> Response<Full<Bytes>> {
    let proxy = match &stub.proxy {
        Some(proxy) => proxy,
        None => return status_response(StatusCode::INTERNAL_SERVER_ERROR),
    };

    let upstream_uri = match build_upstream_uri(proxy, captured, namespace) {
        Ok(uri) => uri,
        Err(e) => {
            error!("cannot parse target url {}: {e}", proxy.target_url);
            return status_response(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let method = match hyper::Method::from_bytes(captured.method.as_bytes()) {
        Ok(method) => method,
        Err(_) => return status_response(StatusCode::INTERNAL_SERVER_ERROR),
    };

    info!("forward {} to {upstream_uri}", captured.method);

    let mut builder = Request::builder().method(method).uri(&upstream_uri);
    for (name, values) in &captured.header {
        if name.eq_ignore_ascii_case("host") {
            continue;
        }

        for value in values {
            builder = builder.header(name, value);
        }
    }

    let request = match builder.body(Full::new(Bytes::from(captured.body.clone()))) {
        Ok(request) => request,
        Err(e) => {
            error!("cannot build upstream request: {e}");
            return status_response(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let upstream = match client.request(request).await {
        Ok(response) => response,
        Err(e) => {
            error!("cannot forward request to {upstream_uri}: {e}");
            return status_response(StatusCode::BAD_GATEWAY);
        }
    };

    let (mut parts, body) = upstream.into_parts();
    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            error!("cannot read upstream response body: {e}");
            return status_response(StatusCode::BAD_GATEWAY);
        }
    };

    info!(
        "forwarded with status code {} length {}",
        parts.status,
        body_bytes.len()
    );

    if proxy.enable_record {
        if let Err(e) = record(store, stub, parts.status.as_u16(), &parts.headers, &body_bytes).await
        {
            error!("cannot record response: {e}");
        }
    }

    // The body was drained into memory; hop-by-hop framing headers no longer
    // describe it
    for name in ["transfer-encoding", "connection", "keep-alive"] {
        parts.headers.remove(name);
    }

    Response::from_parts(parts, Full::new(body_bytes))
}

/// Persists the upstream exchange as a deactivated recorded stub.
async fn record(
    store: &dyn StubStore,
    stub: &Stub,
    status: u16,
    headers: &http::HeaderMap,
    body: &Bytes,
) -> Result<(), crate::store::StoreError> {
    let mut response = response_from_upstream(status, headers);
    response.body = Body(body.to_vec());

    let recorded = Stub {
        id: 0,
        description: format!("Proxy record from stub id {}", stub.id),
        proxy: Some(Proxy::default()),
        active: false,
        tag: TAG_RECORDED_STUB.to_string(),
        response: Some(response),
        created_at: None,
        updated_at: None,
        ..stub.clone()
    };

    let created = store.create(vec![recorded]).await?;
    info!("recording has been created in stub id {}", created[0].id);
    Ok(())
}

fn build_upstream_uri(
    proxy: &Proxy,
    captured: &CapturedRequest,
    namespace: &str,
) -> Result<String, url::ParseError> {
    // Parsing validates the target before any string assembly
    let _ = url::Url::parse(&proxy.target_url)?;
    let base = proxy.target_url.trim_end_matches('/');

    let path = if proxy.target_path.is_empty() {
        rewrite_path(&captured.path, namespace)
    } else {
        format!("/{}", proxy.target_path.trim_start_matches('/'))
    };

    let query = captured
        .url
        .split_once('?')
        .map(|(_, q)| format!("?{q}"))
        .unwrap_or_default();

    Ok(format!("{base}{path}{query}"))
}

/// The mock path carries an echo prefix that must not reach the real
/// service.
fn rewrite_path(path: &str, namespace: &str) -> String {
    let prefix = if namespace.is_empty() {
        "/echo/".to_string()
    } else {
        format!("/{namespace}/echo/")
    };

    let stripped = path.strip_prefix(&prefix).unwrap_or(path);
    format!("/{}", stripped.trim_start_matches('/'))
}
