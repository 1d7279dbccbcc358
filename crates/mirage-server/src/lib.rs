// Library exports for integration tests and embedding in test suites

// ===== Stub model, operators and matching =====
pub mod capture;
pub mod stub;

// ===== Persistence and caching =====
pub mod storage;
pub mod store;

// ===== Protocol frontends =====
pub mod grpc;
pub mod http;

pub mod config;

pub use capture::{CapturedRequest, IncomingRequest};
pub use stub::operator::{
    body_json_path, contains, empty, end_with, equal_to, length, multipart_form, not_contains,
    not_empty, regex, start_with, url_encoded_body,
};
pub use stub::response::{ErrorDetail, Response, ResponseError};
pub use stub::types::{Proxy, RequestMatching, Stub, StubSettings, TAG_RECORDED_STUB};
