//! HTTP listener and routing: admin endpoints plus the echo mock routes.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::FutureExt;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::grpc::descriptor::ServiceDescriptors;
use crate::storage::FileStorage;
use crate::store::StubStore;

use super::admin::handlers::{self, AdminState};
use super::admin::types::{not_found, send_error, send_json, VERDICT_INVALID_PARAMETERS};
use super::handler::MockHandler;
use super::proxy::create_http_client;

/// Shared state of the HTTP frontend.
#[derive(Clone)]
pub struct AppState {
    mock: Arc<MockHandler>,
    admin: Arc<AdminState>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn StubStore>,
        files: Arc<dyn FileStorage>,
        descriptors: Arc<ServiceDescriptors>,
        body_store_threshold: usize,
    ) -> Self {
        let client = create_http_client();
        let mock = Arc::new(MockHandler::new(
            store.clone(),
            files.clone(),
            client,
            body_store_threshold,
        ));
        let admin = Arc::new(AdminState {
            store,
            files,
            descriptors,
        });

        Self { mock, admin }
    }
}

/// HTTP server for the admin API and the mock endpoints.
pub struct HttpServer {
    state: AppState,
}

impl HttpServer {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    pub async fn run(self, addr: &str) -> Result<(), anyhow::Error> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serves connections from an already bound listener; tests bind to an
    /// ephemeral port and pass it in.
    pub async fn serve(self, listener: TcpListener) -> Result<(), anyhow::Error> {
        info!("http server listening on {}", listener.local_addr()?);

        loop {
            let (stream, _) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let state = self.state.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let state = state.clone();
                    async move { route_request(state, req).await }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("connection error: {e}");
                }
            });
        }
    }
}

/// Routes a request, trapping handler panics into a 500 envelope with a
/// correlation id. Broken-pipe panics are only logged since no response can
/// reach the peer.
pub async fn route_request(
    state: AppState,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let result = std::panic::AssertUnwindSafe(dispatch(state, req))
        .catch_unwind()
        .await;

    match result {
        Ok(response) => response,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            if message.to_lowercase().contains("broken pipe") {
                debug!("suppressed broken pipe panic");
            } else {
                let error_id = Uuid::new_v4().to_string();
                error!("handler panicked: {message} (error id {error_id})");
                return Ok(send_error(&error_id));
            }

            Ok(send_error("broken-pipe"))
        }
    }
}

async fn dispatch(
    state: AppState,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = parse_query(req.uri().query());

    debug!("{method} {path}");

    match (&method, path.as_str()) {
        (&Method::POST, "/stub/create_many") => {
            let (content_type, body) = match read_body(req).await {
                Ok(parts) => parts,
                Err(response) => return Ok(response),
            };
            Ok(handlers::create_stubs(&state.admin, &content_type, body).await)
        }

        (&Method::GET, "/stub/list") => Ok(handlers::list_stubs(&state.admin, &query).await),

        (&Method::POST, "/stub/upload") => {
            let (content_type, body) = match read_body(req).await {
                Ok(parts) => parts,
                Err(response) => return Ok(response),
            };
            Ok(handlers::upload_file(&state.admin, &content_type, body).await)
        }

        (&Method::POST, "/proto/upload") => {
            let (content_type, body) = match read_body(req).await {
                Ok(parts) => parts,
                Err(response) => return Ok(response),
            };
            Ok(handlers::upload_proto(&state.admin, &content_type, body).await)
        }

        (&Method::POST, "/incoming_request/list") => {
            let (content_type, body) = match read_body(req).await {
                Ok(parts) => parts,
                Err(response) => return Ok(response),
            };
            Ok(handlers::list_incoming_requests(&state.admin, &content_type, body).await)
        }

        (&Method::DELETE, "/reset") => Ok(handlers::reset(&state.admin, &query).await),

        (&Method::GET, "/ping") => Ok(handlers::ping()),

        _ => match parse_echo_namespace(&path) {
            Some(namespace) => state.mock.handle(&namespace, req).await,
            None => Ok(not_found()),
        },
    }
}

/// Extracts the namespace from a mock route: `/echo/*` is the global
/// namespace, `/<namespace>/echo/*` is namespaced.
fn parse_echo_namespace(path: &str) -> Option<String> {
    if path == "/echo" || path.starts_with("/echo/") {
        return Some(String::new());
    }

    let mut segments = path.trim_start_matches('/').splitn(3, '/');
    let namespace = segments.next().filter(|s| !s.is_empty())?;
    if segments.next() == Some("echo") {
        return Some(namespace.to_string());
    }

    None
}

fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    query
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect()
        })
        .unwrap_or_default()
}

async fn read_body(req: Request<Incoming>) -> Result<(String, Bytes), Response<Full<Bytes>>> {
    let content_type = req
        .headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string();

    match req.into_body().collect().await {
        Ok(collected) => Ok((content_type, collected.to_bytes())),
        Err(e) => Err(send_json(
            StatusCode::BAD_REQUEST,
            VERDICT_INVALID_PARAMETERS,
            &format!("cannot read request body: {e}"),
            serde_json::json!({}),
        )),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        return message.to_string();
    }

    if let Some(message) = panic.downcast_ref::<String>() {
        return message.clone();
    }

    "unknown panic".to_string()
}
