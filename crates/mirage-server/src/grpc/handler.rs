//! End-to-end lifecycle for gRPC calls: every method of every uploaded
//! proto is reachable through the unknown-method dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use prost::Message;
use prost_reflect::DynamicMessage;
use tonic::metadata::MetadataMap;
use tonic::{Code, Status};
use tracing::{error, info, warn};

use crate::capture::{GrpcRequest, IncomingRequest};
use crate::storage::FileStorage;
use crate::store::StubStore;
use crate::stub::operator::CONTENT_TYPE_JSON;
use crate::stub::response::Body as ResponseBody;
use crate::stub::selector::select_stub;
use crate::stub::template::TemplateData;
use crate::stub::types::{Proxy, Stub, TAG_RECORDED_STUB};

use super::descriptor::{Descriptor, ServiceDescriptors};
use super::frame::{decode_frame, encode_frame, GrpcBody};
use super::invoker::invoke_unary;
use super::matching::match_grpc;
use super::status::{convert_grpc_error, convert_status, message_to_json, status_to_trailers};

const HEALTH_CHECK_METHOD: &str = "/grpc.health.v1.Health/Check";

/// Serialized `HealthCheckResponse{status: SERVING}`.
const HEALTH_SERVING: &[u8] = &[0x08, 0x01];

/// Headers that carry transport concerns rather than caller metadata.
const RESERVED_HEADERS: [&str; 6] = [
    "content-type",
    "content-length",
    "te",
    "host",
    "grpc-encoding",
    "grpc-accept-encoding",
];

/// Handles gRPC calls matched against the stub store.
pub struct GrpcHandler {
    store: Arc<dyn StubStore>,
    files: Arc<dyn FileStorage>,
    descriptors: Arc<ServiceDescriptors>,
}

/// Outcome of one call: response metadata, an optional message frame and
/// the closing status.
struct GrpcReply {
    metadata: HashMap<String, String>,
    message: Option<Bytes>,
    status: Status,
}

impl GrpcReply {
    fn from_status(status: Status) -> Self {
        Self {
            metadata: HashMap::new(),
            message: None,
            status,
        }
    }
}

impl GrpcHandler {
    pub fn new(
        store: Arc<dyn StubStore>,
        files: Arc<dyn FileStorage>,
        descriptors: Arc<ServiceDescriptors>,
    ) -> Self {
        Self {
            store,
            files,
            descriptors,
        }
    }

    /// Serves one unary call. The capture is persisted after the exchange
    /// regardless of the outcome.
    pub async fn handle(&self, req: Request<Incoming>) -> Response<GrpcBody> {
        let full_method = req.uri().path().to_string();
        info!("received grpc with full method {full_method}");

        if full_method == HEALTH_CHECK_METHOD {
            let reply = GrpcReply {
                metadata: HashMap::new(),
                message: Some(encode_frame(HEALTH_SERVING)),
                status: Status::new(Code::Ok, String::new()),
            };
            return build_response(reply);
        }

        let metadata = capture_metadata(req.headers());
        let headers = req.headers().clone();

        let payload = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                error!("cannot read request body: {e}");
                return build_response(GrpcReply::from_status(Status::new(
                    Code::Internal,
                    "cannot read request body",
                )));
            }
        };

        let mut incoming =
            IncomingRequest::capture_grpc(&full_method, metadata.clone(), Vec::new());

        let reply = match self
            .serve(&full_method, &metadata, &headers, &payload, &mut incoming)
            .await
        {
            Ok(reply) => reply,
            Err(status) => GrpcReply::from_status(status),
        };

        if let Err(e) = self.store.create_incoming_request(incoming).await {
            error!("cannot persist incoming request: {e}");
        }

        build_response(reply)
    }

    async fn serve(
        &self,
        full_method: &str,
        metadata: &HashMap<String, Vec<String>>,
        headers: &http::HeaderMap,
        payload: &[u8],
        incoming: &mut IncomingRequest,
    ) -> Result<GrpcReply, Status> {
        let descriptor = self.get_proto_descriptor(full_method).await?;
        let method = descriptor.get_method(full_method)?;

        let message_payload = decode_frame(payload)?;
        let input = DynamicMessage::decode(method.input(), message_payload).map_err(|e| {
            error!("cannot parse input: {e}");
            Status::new(Code::InvalidArgument, format!("cannot parse input: {e}"))
        })?;

        let input_json = message_to_json(&input)?;
        let input_data = match &input_json {
            serde_json::Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };

        incoming.body = ResponseBody(input_json.to_string().into_bytes());

        let grpc_request = GrpcRequest {
            full_method: full_method.to_string(),
            input_data,
        };

        let stub = self.get_matched_stub(&grpc_request, metadata).await?;
        incoming.stub_id = stub.id;
        incoming.tag = stub.tag.clone();

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
            return self
                .reverse_proxy(&stub, &descriptor, &method, input, headers)
                .await;
        }

        self.write_stub_response(&stub, &descriptor, &method, &grpc_request)
            .await
    }

    async fn get_proto_descriptor(&self, full_method: &str) -> Result<Arc<Descriptor>, Status> {
        let protos = self
            .store
            .get_protos()
            .await
            .map_err(|e| Status::new(Code::Internal, e.to_string()))?;

        for proto in &protos {
            if proto.methods.iter().any(|m| m == full_method) {
                return self
                    .descriptors
                    .get_descriptor(&proto.file_id)
                    .await
                    .map_err(|e| Status::new(Code::Internal, e.to_string()));
            }
        }

        let status = Status::new(Code::NotFound, format!("no proto for {full_method}"));
        error!("{}", status.message());
        Err(status)
    }

    async fn get_matched_stub(
        &self,
        request: &GrpcRequest,
        metadata: &HashMap<String, Vec<String>>,
    ) -> Result<Stub, Status> {
        let stubs = self
            .store
            .get_all("")
            .await
            .map_err(|e| Status::new(Code::Internal, e.to_string()))?;

        if stubs.is_empty() {
            return Err(Status::new(
                Code::NotFound,
                format!("no stub for {}", request.full_method),
            ));
        }

        let total = stubs.len();
        let mut matched = Vec::with_capacity(total);
        for stub in stubs {
            match match_grpc(&stub, request, metadata) {
                Ok(true) => matched.push(stub),
                Ok(false) => {}
                Err(e) => return Err(Status::new(Code::Internal, e.to_string())),
            }
        }

        let stub = select_stub(matched).ok_or_else(|| {
            Status::new(
                Code::NotFound,
                format!("no matched stub found for {}", request.full_method),
            )
        })?;

        info!("matched stub {} out of {total}", stub.id);
        Ok(stub)
    }

    /// Forwards the call to the stub's target via dynamic invocation and
    /// relays the answer; failures forward the upstream status verbatim.
    /// The recorder fires on both paths.
    async fn reverse_proxy(
        &self,
        stub: &Stub,
        descriptor: &Descriptor,
        method: &prost_reflect::MethodDescriptor,
        input: DynamicMessage,
        headers: &http::HeaderMap,
    ) -> Result<GrpcReply, Status> {
        let target_url = stub
            .proxy
            .as_ref()
            .map(|p| p.target_url.clone())
            .unwrap_or_default();

        info!("forward {} to {target_url}", method.name());

        let mut outgoing = http::HeaderMap::new();
        for (name, value) in headers {
            if !RESERVED_HEADERS.contains(&name.as_str()) {
                outgoing.append(name.clone(), value.clone());
            }
        }
        outgoing.insert("x-proxy", http::HeaderValue::from_static("rio"));

        let result = invoke_unary(
            &target_url,
            method,
            input,
            MetadataMap::from_headers(outgoing),
        )
        .await;

        let reply = match &result {
            Ok(response) => {
                let metadata = response
                    .metadata()
                    .clone()
                    .into_headers()
                    .iter()
                    .filter_map(|(k, v)| {
                        v.to_str()
                            .ok()
                            .map(|value| (k.to_string(), value.to_string()))
                    })
                    .collect();

                GrpcReply {
                    metadata,
                    message: Some(encode_frame(&response.get_ref().encode_to_vec())),
                    status: Status::new(Code::Ok, String::new()),
                }
            }
            Err(status) => GrpcReply::from_status(status.clone()),
        };

        let output = result.as_ref().ok().map(|r| r.get_ref());
        let status = result.as_ref().err().cloned().unwrap_or_else(|| Status::new(Code::Ok, ""));
        if let Err(e) = self
            .record_response(stub, descriptor, output, &status)
            .await
        {
            error!("cannot record response: {e}");
        }

        Ok(reply)
    }

    async fn record_response(
        &self,
        stub: &Stub,
        descriptor: &Descriptor,
        output: Option<&DynamicMessage>,
        status: &Status,
    ) -> Result<(), Status> {
        let enabled = stub.proxy.as_ref().map(|p| p.enable_record).unwrap_or(false);
        if !enabled {
            return Ok(());
        }

        let mut response = crate::stub::response::Response::new()
            .with_status_code(status.code() as i32);
        response.error = convert_grpc_error(descriptor, status);

        if let Some(output) = output {
            let body = message_to_json(output)?;
            response = response.with_body(CONTENT_TYPE_JSON, body.to_string().into_bytes());
        }

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

        let created = self
            .store
            .create(vec![recorded])
            .await
            .map_err(|e| Status::new(Code::Internal, e.to_string()))?;

        info!("recording has been created in stub id {}", created[0].id);
        Ok(())
    }

    async fn write_stub_response(
        &self,
        stub: &Stub,
        descriptor: &Descriptor,
        method: &prost_reflect::MethodDescriptor,
        grpc_request: &GrpcRequest,
    ) -> Result<GrpcReply, Status> {
        let mut response = stub
            .response
            .clone()
            .ok_or_else(|| Status::new(Code::Internal, "stub has no response"))?;

        if !response.body_file.is_empty() {
            response
                .load_body_from_file(self.files.as_ref())
                .await
                .map_err(|e| Status::new(Code::Internal, e.to_string()))?;
        }

        if stub.has_template() {
            let data = TemplateData::for_grpc(grpc_request);
            response.load_body_from_template(&data).map_err(|e| {
                error!("cannot execute template: {e}");
                Status::new(Code::Internal, e.to_string())
            })?;
        }

        let message = if response.body.is_empty() {
            None
        } else {
            let value: serde_json::Value =
                serde_json::from_slice(response.body.as_slice()).map_err(|e| {
                    error!("cannot parse response body as json: {e}");
                    Status::new(Code::Internal, format!("cannot encode message: {e}"))
                })?;

            let output = DynamicMessage::deserialize(method.output(), value).map_err(|e| {
                error!("cannot encode message: {e}");
                Status::new(Code::Internal, format!("cannot encode message: {e}"))
            })?;

            Some(encode_frame(&output.encode_to_vec()))
        };

        Ok(GrpcReply {
            metadata: response.header.clone(),
            message,
            status: convert_status(descriptor, &response),
        })
    }
}

fn capture_metadata(headers: &http::HeaderMap) -> HashMap<String, Vec<String>> {
    let mut metadata: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            metadata
                .entry(name.as_str().to_lowercase())
                .or_default()
                .push(value.to_string());
        }
    }

    metadata
}

fn build_response(reply: GrpcReply) -> Response<GrpcBody> {
    let mut builder = Response::builder()
        .status(200)
        .header("content-type", "application/grpc");

    for (name, value) in &reply.metadata {
        if RESERVED_HEADERS.contains(&name.to_lowercase().as_str()) {
            continue;
        }

        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::from_bytes(name.as_bytes()),
            http::HeaderValue::from_str(value),
        ) {
            builder = builder.header(name, value);
        }
    }

    let trailers = status_to_trailers(&reply.status);
    builder
        .body(GrpcBody::new(reply.message, trailers))
        .unwrap_or_else(|_| {
            Response::new(GrpcBody::new(
                None,
                status_to_trailers(&Status::new(Code::Internal, "cannot build response")),
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_metadata_lowercases_names() {
        let mut headers = http::HeaderMap::new();
        headers.insert("X-Request-Id", "R1".parse().unwrap());
        headers.append("x-multi", "a".parse().unwrap());
        headers.append("x-multi", "b".parse().unwrap());

        let metadata = capture_metadata(&headers);
        assert_eq!(metadata.get("x-request-id").unwrap(), &vec!["R1".to_string()]);
        assert_eq!(metadata.get("x-multi").unwrap().len(), 2);
    }

    #[test]
    fn test_build_response_sets_grpc_headers() {
        let reply = GrpcReply {
            metadata: HashMap::from([("x-meta".to_string(), "1".to_string())]),
            message: None,
            status: Status::new(Code::NotFound, "no matched stub"),
        };

        let response = build_response(reply);
        assert_eq!(response.status(), 200);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/grpc"
        );
        assert_eq!(response.headers().get("x-meta").unwrap(), "1");
    }
}
