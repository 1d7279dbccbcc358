//! Admin endpoint handlers.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::error;
use uuid::Uuid;

use crate::grpc::descriptor::ServiceDescriptors;
use crate::storage::FileStorage;
use crate::store::{IncomingQueryOption, ResetQueryOption, StubStore};
use crate::stub::types::{Proto, Stub, METHOD_GRPC, PROTOCOL_GRPC, PROTOCOL_HTTP};

use super::types::{
    decode_stub_bodies, parse_payload, send_error, send_json, send_success,
    VERDICT_INVALID_PARAMETERS, VERDICT_MISSING_PARAMETERS,
};

/// Shared state of the admin handlers.
pub struct AdminState {
    pub store: Arc<dyn StubStore>,
    pub files: Arc<dyn FileStorage>,
    pub descriptors: Arc<ServiceDescriptors>,
}

#[derive(Debug, Deserialize)]
struct StubRequestParam {
    #[serde(default)]
    stubs: Vec<Stub>,

    /// Typed SDK clients expect encoded bodies back; interactive clients
    /// prefer them decoded into structured JSON.
    #[serde(default)]
    return_encoded: bool,
}

/// POST /stub/create_many
pub async fn create_stubs(
    state: &AdminState,
    content_type: &str,
    body: Bytes,
) -> Response<Full<Bytes>> {
    let mut params: StubRequestParam = match parse_payload(content_type, &body) {
        Ok(params) => params,
        Err(e) => {
            return send_json(
                StatusCode::BAD_REQUEST,
                VERDICT_INVALID_PARAMETERS,
                &e,
                json!({}),
            )
        }
    };

    if params.stubs.is_empty() {
        return send_json(
            StatusCode::BAD_REQUEST,
            VERDICT_MISSING_PARAMETERS,
            "missing parameters",
            json!({}),
        );
    }

    for (i, stub) in params.stubs.iter_mut().enumerate() {
        if let Err(e) = stub.validate() {
            return send_json(
                StatusCode::BAD_REQUEST,
                VERDICT_INVALID_PARAMETERS,
                &format!("invalid stub at index {i} - {e}"),
                json!({}),
            );
        }

        let is_grpc = stub
            .request
            .as_ref()
            .map(|r| r.method == METHOD_GRPC)
            .unwrap_or(false);
        stub.protocol = if is_grpc { PROTOCOL_GRPC } else { PROTOCOL_HTTP }.to_string();
    }

    let created = match state.store.create(params.stubs).await {
        Ok(created) => created,
        Err(e) => return log_and_fail("cannot create stubs", &e.to_string()),
    };

    let data = match stubs_payload(&created, !params.return_encoded) {
        Ok(data) => data,
        Err(e) => return log_and_fail("cannot encode stubs", &e),
    };

    send_success("add stubs successfully", data)
}

/// GET /stub/list
pub async fn list_stubs(state: &AdminState, query: &HashMap<String, String>) -> Response<Full<Bytes>> {
    let namespace = query.get("namespace").cloned().unwrap_or_default();

    let stubs = match state.store.get_all(&namespace).await {
        Ok(stubs) => stubs,
        Err(e) => return log_and_fail("cannot list stubs", &e.to_string()),
    };

    let data = match stubs_payload(&stubs, true) {
        Ok(data) => data,
        Err(e) => return log_and_fail("cannot encode stubs", &e),
    };

    send_success("list stubs successfully", data)
}

/// POST /stub/upload
pub async fn upload_file(
    state: &AdminState,
    content_type: &str,
    body: Bytes,
) -> Response<Full<Bytes>> {
    let (fields, files) = match parse_multipart(content_type, body).await {
        Ok(parsed) => parsed,
        Err(e) => {
            return send_json(
                StatusCode::BAD_REQUEST,
                VERDICT_INVALID_PARAMETERS,
                &e,
                json!({}),
            )
        }
    };

    let data = match files.get("file") {
        Some(data) => data.clone(),
        None => {
            return send_json(
                StatusCode::BAD_REQUEST,
                VERDICT_MISSING_PARAMETERS,
                "missing file",
                json!({}),
            )
        }
    };

    let file_id = fields
        .get("file_id")
        .filter(|id| !id.is_empty())
        .cloned()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if let Err(e) = state.files.upload_file(&file_id, data).await {
        return log_and_fail("cannot upload file", &e.to_string());
    }

    send_success("upload file successfully", json!({ "file_id": file_id }))
}

/// POST /proto/upload
pub async fn upload_proto(
    state: &AdminState,
    content_type: &str,
    body: Bytes,
) -> Response<Full<Bytes>> {
    let (fields, files) = match parse_multipart(content_type, body).await {
        Ok(parsed) => parsed,
        Err(e) => {
            return send_json(
                StatusCode::BAD_REQUEST,
                VERDICT_INVALID_PARAMETERS,
                &e,
                json!({}),
            )
        }
    };

    let data = match files.get("file") {
        Some(data) => data.clone(),
        None => {
            return send_json(
                StatusCode::BAD_REQUEST,
                VERDICT_MISSING_PARAMETERS,
                "missing file",
                json!({}),
            )
        }
    };

    let name = fields.get("name").cloned().unwrap_or_default();

    let file_id = Uuid::new_v4().to_string();
    if let Err(e) = state.files.upload_file(&file_id, data).await {
        return log_and_fail("cannot upload proto bundle", &e.to_string());
    }

    // Parse before persisting; a bundle that does not compile or exposes no
    // methods never reaches the store
    let descriptor = match state.descriptors.get_descriptor(&file_id).await {
        Ok(descriptor) => descriptor,
        Err(e) => {
            error!("cannot parse uploaded proto bundle: {e}");
            let _ = state.files.delete_file(&file_id).await;
            return send_json(
                StatusCode::BAD_REQUEST,
                VERDICT_INVALID_PARAMETERS,
                "invalid proto",
                json!({}),
            );
        }
    };

    let proto = Proto {
        name,
        file_id: file_id.clone(),
        methods: descriptor.get_all_methods(),
        types: descriptor.get_all_messages(),
        ..Default::default()
    };

    if proto.methods.is_empty() {
        let _ = state.files.delete_file(&file_id).await;
        return send_json(
            StatusCode::BAD_REQUEST,
            VERDICT_INVALID_PARAMETERS,
            "invalid proto",
            json!({}),
        );
    }

    let created = match state.store.create_proto(vec![proto]).await {
        Ok(created) => created,
        Err(e) => return log_and_fail("cannot persist proto", &e.to_string()),
    };

    send_success("upload proto successfully", json!({ "proto": created[0] }))
}

/// POST /incoming_request/list
pub async fn list_incoming_requests(
    state: &AdminState,
    content_type: &str,
    body: Bytes,
) -> Response<Full<Bytes>> {
    let mut option: IncomingQueryOption = match parse_payload(content_type, &body) {
        Ok(option) => option,
        Err(e) => {
            return send_json(
                StatusCode::BAD_REQUEST,
                VERDICT_INVALID_PARAMETERS,
                &e,
                json!({}),
            )
        }
    };

    if option.limit == 0 {
        option.limit = 10;
    }

    let requests = match state.store.get_incoming_requests(&option).await {
        Ok(requests) => requests,
        Err(e) => return log_and_fail("cannot list incoming requests", &e.to_string()),
    };

    send_success(
        "get incoming request successfully",
        json!({ "requests": requests }),
    )
}

/// DELETE /reset
pub async fn reset(state: &AdminState, query: &HashMap<String, String>) -> Response<Full<Bytes>> {
    let option = ResetQueryOption {
        namespace: query.get("namespace").cloned().unwrap_or_default(),
        tag: query.get("tag").cloned().unwrap_or_default(),
    };

    if let Err(e) = state.store.reset(&option).await {
        return log_and_fail("cannot reset", &e.to_string());
    }

    send_success(
        &format!(
            "reset data in '{}' and tag '{}' successfully",
            option.namespace, option.tag
        ),
        json!({}),
    )
}

/// GET /ping
pub fn ping() -> Response<Full<Bytes>> {
    send_success("pong", json!({}))
}

fn stubs_payload(stubs: &[Stub], should_decode: bool) -> Result<serde_json::Value, String> {
    let value = serde_json::to_value(stubs).map_err(|e| e.to_string())?;
    let value = if should_decode {
        decode_stub_bodies(value)
    } else {
        value
    };

    Ok(json!({ "stubs": value }))
}

fn log_and_fail(context: &str, detail: &str) -> Response<Full<Bytes>> {
    let error_id = Uuid::new_v4().to_string();
    error!("{context}: {detail} (error id {error_id})");
    send_error(&error_id)
}

/// Collects text fields and file contents from a multipart payload.
async fn parse_multipart(
    content_type: &str,
    body: Bytes,
) -> Result<(HashMap<String, String>, HashMap<String, Vec<u8>>), String> {
    let boundary = multer::parse_boundary(content_type).map_err(|e| e.to_string())?;
    let stream = futures_util::stream::once(async move { Ok::<Bytes, Infallible>(body) });
    let mut multipart = multer::Multipart::new(stream, boundary);

    let mut fields = HashMap::new();
    let mut files = HashMap::new();

    while let Some(field) = multipart.next_field().await.map_err(|e| e.to_string())? {
        let name = match field.name() {
            Some(name) => name.to_string(),
            None => continue,
        };

        if field.file_name().is_some() {
            let data = field.bytes().await.map_err(|e| e.to_string())?;
            files.insert(name, data.to_vec());
        } else {
            let value = field.text().await.map_err(|e| e.to_string())?;
            fields.insert(name, value);
        }
    }

    Ok((fields, files))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StubMemoryStore;
    use crate::storage::{LocalStorage, LocalStorageConfig};
    use crate::stub::operator::contains;
    use http_body_util::BodyExt;

    fn test_state() -> AdminState {
        let store = Arc::new(StubMemoryStore::new());
        let files = Arc::new(LocalStorage::new(LocalStorageConfig {
            storage_path: format!("mirage-admin-test-{}", Uuid::new_v4()),
            use_temp_dir: true,
        }));

        AdminState {
            store,
            descriptors: Arc::new(ServiceDescriptors::new(files.clone())),
            files,
        }
    }

    async fn body_json(response: Response<Full<Bytes>>) -> serde_json::Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_create_stubs_missing_parameters() {
        let state = test_state();
        let response = create_stubs(&state, "application/json", Bytes::from(r#"{"stubs": []}"#)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let envelope = body_json(response).await;
        assert_eq!(envelope["verdict"], "missing_parameters");
    }

    #[tokio::test]
    async fn test_create_stubs_invalid_stub() {
        let state = test_state();
        let payload = json!({"stubs": [{"request": {"method": "GET"}}]});
        let response = create_stubs(
            &state,
            "application/json",
            Bytes::from(payload.to_string()),
        )
        .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let envelope = body_json(response).await;
        assert_eq!(envelope["verdict"], "invalid_parameters");
    }

    #[tokio::test]
    async fn test_create_and_list_stubs() {
        let state = test_state();
        let stub = Stub::new()
            .for_method("GET", vec![contains("animal")])
            .will_return(crate::stub::response::Response::json(json!({"id": "A1"})))
            .with_namespace("ns1");

        let payload = json!({ "stubs": [stub] });
        let response = create_stubs(
            &state,
            "application/json",
            Bytes::from(payload.to_string()),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let envelope = body_json(response).await;
        assert_eq!(envelope["verdict"], "success");
        // Bodies come back decoded into structured JSON by default
        assert_eq!(
            envelope["data"]["stubs"][0]["response"]["body"],
            json!({"id": "A1"})
        );

        let query = HashMap::from([("namespace".to_string(), "ns1".to_string())]);
        let envelope = body_json(list_stubs(&state, &query).await).await;
        assert_eq!(envelope["data"]["stubs"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_stubs_marks_grpc_protocol() {
        let state = test_state();
        let stub = Stub::new().for_grpc(vec![contains("OfferService")]);
        let payload = json!({ "stubs": [stub], "return_encoded": true });

        let response = create_stubs(
            &state,
            "application/json",
            Bytes::from(payload.to_string()),
        )
        .await;
        let envelope = body_json(response).await;
        assert_eq!(envelope["data"]["stubs"][0]["protocol"], "grpc");
    }

    #[tokio::test]
    async fn test_reset_endpoint() {
        let state = test_state();
        let stub = Stub::new().for_any(vec![]).with_namespace("ns1");
        state.store.create(vec![stub]).await.unwrap();

        let query = HashMap::from([("namespace".to_string(), "ns1".to_string())]);
        let envelope = body_json(reset(&state, &query).await).await;
        assert_eq!(envelope["verdict"], "success");
        assert!(state.store.get_all("ns1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ping() {
        let envelope = body_json(ping()).await;
        assert_eq!(envelope["verdict"], "success");
        assert_eq!(envelope["message"], "pong");
    }
}
