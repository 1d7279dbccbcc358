//! End-to-end tests for the gRPC mock surface, driven by the dynamic
//! client used for reverse proxying.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use prost::Message;
use prost_reflect::{DescriptorPool, DynamicMessage};
use serde_json::json;
use tokio::net::TcpListener;
use tonic::metadata::MetadataMap;
use tonic::Code;

use mirage_server::grpc::descriptor::ServiceDescriptors;
use mirage_server::grpc::invoker::invoke_unary;
use mirage_server::grpc::GrpcServer;
use mirage_server::storage::{FileStorage, LocalStorage, LocalStorageConfig};
use mirage_server::store::{IncomingQueryOption, StubMemoryStore, StubStore};
use mirage_server::stub::operator::{body_json_path, contains, equal_to};
use mirage_server::stub::types::Proto;
use mirage_server::{ErrorDetail, Response, Stub, TAG_RECORDED_STUB};

const FULL_METHOD: &str = "/offers.v1.OfferService/ValidateOffer";

const OFFERS_PROTO: &str = r#"syntax = "proto3";

package offers.v1;

import "common/errors.proto";

message ValidateOfferRequest {
  string request_id = 1;
}

message ValidateOfferResponse {
  string verdict = 1;
  common.v1.CommonError error = 2;
}

service OfferService {
  rpc ValidateOffer(ValidateOfferRequest) returns (ValidateOfferResponse);
}
"#;

const COMMON_PROTO: &str = r#"syntax = "proto3";

package common.v1;

message CommonError {
  string verdict = 1;
}
"#;

/// Compiles the test protos the same way the server does from an uploaded
/// bundle, giving the client side its method descriptors.
fn compile_pool(dir: &Path) -> DescriptorPool {
    std::fs::create_dir_all(dir.join("common")).unwrap();
    std::fs::write(dir.join("offers.proto"), OFFERS_PROTO).unwrap();
    std::fs::write(dir.join("common/errors.proto"), COMMON_PROTO).unwrap();

    let file_set = protox::compile(
        [dir.join("offers.proto"), dir.join("common/errors.proto")],
        [dir.to_path_buf()],
    )
    .unwrap();
    DescriptorPool::from_file_descriptor_set(file_set).unwrap()
}

fn proto_zip() -> Vec<u8> {
    let mut bytes = Vec::new();
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut bytes));
    let options = zip::write::SimpleFileOptions::default();

    writer.start_file("offers.proto", options).unwrap();
    writer.write_all(OFFERS_PROTO.as_bytes()).unwrap();
    writer.start_file("common/errors.proto", options).unwrap();
    writer.write_all(COMMON_PROTO.as_bytes()).unwrap();
    writer.finish().unwrap();

    bytes
}

struct TestServer {
    address: String,
    store: Arc<StubMemoryStore>,
}

/// Starts a gRPC mock with the offer service proto registered.
async fn start_server() -> TestServer {
    let store = Arc::new(StubMemoryStore::new());
    let files = Arc::new(LocalStorage::new(LocalStorageConfig {
        storage_path: format!("mirage-grpc-test-{}", uuid::Uuid::new_v4()),
        use_temp_dir: true,
    }));
    let descriptors = Arc::new(ServiceDescriptors::new(files.clone()));

    let file_id = uuid::Uuid::new_v4().to_string();
    files.upload_file(&file_id, proto_zip()).await.unwrap();

    store
        .create_proto(vec![Proto {
            name: "offers".to_string(),
            file_id,
            methods: vec![FULL_METHOD.to_string()],
            types: vec![
                "offers.v1.ValidateOfferRequest".to_string(),
                "offers.v1.ValidateOfferResponse".to_string(),
                "common.v1.CommonError".to_string(),
            ],
            ..Default::default()
        }])
        .await
        .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(GrpcServer::new(store.clone(), files, descriptors).serve(listener));

    TestServer {
        address: format!("http://{addr}"),
        store,
    }
}

fn request_message(pool: &DescriptorPool, request_id: &str) -> DynamicMessage {
    let descriptor = pool
        .get_message_by_name("offers.v1.ValidateOfferRequest")
        .unwrap();
    DynamicMessage::deserialize(descriptor, json!({ "request_id": request_id })).unwrap()
}

#[tokio::test]
async fn test_grpc_match_and_respond() {
    let server = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let pool = compile_pool(dir.path());
    let method = pool.get_service_by_name("offers.v1.OfferService").unwrap()
        .methods()
        .next()
        .unwrap();

    let stub = Stub::new()
        .for_grpc(vec![equal_to(FULL_METHOD)])
        .with_request_body(body_json_path("$.request_id", equal_to("R1")))
        .will_return(
            Response::json(json!({"verdict": "ok"})).with_header("x-meta", "m1"),
        );
    server.store.create(vec![stub]).await.unwrap();

    let response = invoke_unary(
        &server.address,
        &method,
        request_message(&pool, "R1"),
        MetadataMap::new(),
    )
    .await
    .unwrap();

    assert_eq!(response.metadata().get("x-meta").unwrap(), "m1");
    let output = serde_json::to_value(response.get_ref()).unwrap();
    assert_eq!(output["verdict"], "ok");

    // The decoded input message is captured as the request body
    let captures = server
        .store
        .get_incoming_requests(&IncomingQueryOption {
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(captures.len(), 1);
    assert_eq!(captures[0].method, "grpc");
    assert_eq!(captures[0].url, FULL_METHOD);
    assert_eq!(captures[0].body.as_slice(), br#"{"request_id":"R1"}"#);
}

#[tokio::test]
async fn test_grpc_no_matched_stub_is_not_found() {
    let server = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let pool = compile_pool(dir.path());
    let method = pool.get_service_by_name("offers.v1.OfferService").unwrap()
        .methods()
        .next()
        .unwrap();

    let stub = Stub::new()
        .for_grpc(vec![equal_to(FULL_METHOD)])
        .with_request_body(body_json_path("$.request_id", equal_to("R1")))
        .will_return(Response::json(json!({"verdict": "ok"})));
    server.store.create(vec![stub]).await.unwrap();

    let err = invoke_unary(
        &server.address,
        &method,
        request_message(&pool, "OTHER"),
        MetadataMap::new(),
    )
    .await
    .unwrap_err();

    assert_eq!(err.code(), Code::NotFound);
}

#[tokio::test]
async fn test_grpc_error_with_details() {
    let server = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let pool = compile_pool(dir.path());
    let method = pool.get_service_by_name("offers.v1.OfferService").unwrap()
        .methods()
        .next()
        .unwrap();

    let stub = Stub::new()
        .for_grpc(vec![equal_to(FULL_METHOD)])
        .with_request_body(body_json_path("$.request_id", equal_to("R1")))
        .will_return(Response::new().with_status_code(13).with_error(
            "error",
            vec![ErrorDetail {
                type_name: "common.v1.CommonError".to_string(),
                value: json!({"verdict": "success"}).as_object().unwrap().clone(),
            }],
        ));
    server.store.create(vec![stub]).await.unwrap();

    let err = invoke_unary(
        &server.address,
        &method,
        request_message(&pool, "R1"),
        MetadataMap::new(),
    )
    .await
    .unwrap_err();

    assert_eq!(err.code(), Code::Internal);
    assert_eq!(err.message(), "error");

    // Decode the rich status details with the same descriptors
    let rich = tonic_types::Status::decode(err.details()).unwrap();
    assert_eq!(rich.details.len(), 1);
    assert!(rich.details[0].type_url.ends_with("common.v1.CommonError"));

    let descriptor = pool.get_message_by_name("common.v1.CommonError").unwrap();
    let detail =
        DynamicMessage::decode(descriptor, rich.details[0].value.as_slice()).unwrap();
    let detail = serde_json::to_value(&detail).unwrap();
    assert_eq!(detail["verdict"], "success");
}

#[tokio::test]
async fn test_grpc_unknown_method_is_not_found() {
    let server = start_server().await;
    let dir = tempfile::tempdir().unwrap();

    // A proto the server has never seen
    let other_dir = dir.path().join("other");
    std::fs::create_dir_all(&other_dir).unwrap();
    std::fs::write(
        other_dir.join("other.proto"),
        "syntax = \"proto3\";\npackage other.v1;\nmessage Empty {}\nservice Other { rpc Call(Empty) returns (Empty); }\n",
    )
    .unwrap();
    let file_set = protox::compile([other_dir.join("other.proto")], [other_dir]).unwrap();
    let pool = DescriptorPool::from_file_descriptor_set(file_set).unwrap();
    let method = pool.get_service_by_name("other.v1.Other").unwrap()
        .methods()
        .next()
        .unwrap();

    let input = DynamicMessage::new(method.input());
    let err = invoke_unary(&server.address, &method, input, MetadataMap::new())
        .await
        .unwrap_err();

    assert_eq!(err.code(), Code::NotFound);
}

#[tokio::test]
async fn test_grpc_proxy_with_recording() {
    // The upstream is a second mock with a direct stub; matching on the
    // forwarded x-proxy marker proves metadata propagation
    let upstream = start_server().await;
    let upstream_stub = Stub::new()
        .for_grpc(vec![equal_to(FULL_METHOD)])
        .with_header("x-proxy", equal_to("rio"))
        .will_return(Response::json(json!({"verdict": "from-upstream"})));
    upstream.store.create(vec![upstream_stub]).await.unwrap();

    let server = start_server().await;
    let proxy_stub = Stub::new()
        .for_grpc(vec![contains("OfferService")])
        .with_target_url(&upstream.address)
        .with_enable_record(true);
    server.store.create(vec![proxy_stub]).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let pool = compile_pool(dir.path());
    let method = pool.get_service_by_name("offers.v1.OfferService").unwrap()
        .methods()
        .next()
        .unwrap();

    let response = invoke_unary(
        &server.address,
        &method,
        request_message(&pool, "R1"),
        MetadataMap::new(),
    )
    .await
    .unwrap();

    let output = serde_json::to_value(response.get_ref()).unwrap();
    assert_eq!(output["verdict"], "from-upstream");

    let recorded = server
        .store
        .snapshot_stubs()
        .into_iter()
        .find(|s| s.tag == TAG_RECORDED_STUB)
        .expect("recorded stub present");

    assert!(!recorded.active);
    assert!(recorded.proxy.as_ref().unwrap().target_url.is_empty());
    let body = recorded.response.as_ref().unwrap().body.as_slice().to_vec();
    let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["verdict"], "from-upstream");
}
