//! Conversion between stub responses and gRPC statuses, including rich
//! error details carried as `google.rpc.Status`.

use base64::engine::general_purpose::STANDARD_NO_PAD as BASE64_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use prost::Message;
use prost_reflect::{DynamicMessage, SerializeOptions};
use serde_json::Value;
use tonic::{Code, Status};
use tracing::error;

use crate::stub::response::{ErrorDetail, Response, ResponseError};

use super::descriptor::Descriptor;

const TYPE_URL_PREFIX: &str = "type.googleapis.com";

// grpc-message must stay ASCII; encode controls and the escape char itself
const GRPC_MESSAGE_SET: &AsciiSet = &CONTROLS.add(b'%');

/// Serializes a dynamic message to JSON with original proto field names, so
/// stub authors can address fields the way the proto declares them.
pub fn message_to_json(message: &DynamicMessage) -> Result<Value, Status> {
    message
        .serialize_with_options(
            serde_json::value::Serializer,
            &SerializeOptions::new().use_proto_field_name(true),
        )
        .map_err(|e| {
            error!("cannot serialize message: {e}");
            Status::internal(format!("cannot serialize message: {e}"))
        })
}

/// Builds the outgoing status for a stub response: the stored status code
/// plus any declared error message and details, each detail encoded via its
/// descriptor.
pub fn convert_status(descriptor: &Descriptor, response: &Response) -> Status {
    let code = Code::from(response.status_code);
    let error = match &response.error {
        Some(error) => error,
        None => return Status::new(code, ""),
    };

    // Details are not allowed for status OK
    if error.details.is_empty() || code == Code::Ok {
        return Status::new(code, error.message.clone());
    }

    let mut details = Vec::with_capacity(error.details.len());
    for detail in &error.details {
        let descriptor = match descriptor.get_message(&detail.type_name) {
            Ok(descriptor) => descriptor,
            Err(e) => return Status::new(Code::InvalidArgument, e.message().to_string()),
        };

        let message = match DynamicMessage::deserialize(
            descriptor,
            Value::Object(detail.value.clone()),
        ) {
            Ok(message) => message,
            Err(e) => {
                error!("cannot encode error detail: {e}");
                return Status::new(Code::InvalidArgument, "invalid error detail");
            }
        };

        details.push(prost_types::Any {
            type_url: format!("{TYPE_URL_PREFIX}/{}", detail.type_name),
            value: message.encode_to_vec(),
        });
    }

    let rich = tonic_types::Status {
        code: response.status_code,
        message: error.message.clone(),
        details,
    };

    Status::with_details(code, error.message.clone(), Bytes::from(rich.encode_to_vec()))
}

/// Converts an upstream status into the stub error model; details are
/// decoded by looking up each type url in the bundle descriptor. Details of
/// unknown types are dropped.
pub fn convert_grpc_error(descriptor: &Descriptor, status: &Status) -> Option<ResponseError> {
    if status.code() == Code::Ok {
        return None;
    }

    let mut response_error = ResponseError {
        message: status.message().to_string(),
        details: Vec::new(),
    };

    let detail_bytes = status.details();
    if detail_bytes.is_empty() {
        return Some(response_error);
    }

    let rich = match tonic_types::Status::decode(detail_bytes) {
        Ok(rich) => rich,
        Err(e) => {
            error!("cannot decode status details: {e}");
            return Some(response_error);
        }
    };

    for any in rich.details {
        let message_descriptor = match descriptor.get_message(&any.type_url) {
            Ok(descriptor) => descriptor,
            Err(_) => continue,
        };

        let message = match DynamicMessage::decode(message_descriptor, any.value.as_slice()) {
            Ok(message) => message,
            Err(e) => {
                error!("cannot convert detail: {e}");
                continue;
            }
        };

        let value = match message_to_json(&message) {
            Ok(Value::Object(map)) => map,
            _ => continue,
        };

        response_error.details.push(ErrorDetail {
            type_name: any.type_url,
            value,
        });
    }

    Some(response_error)
}

/// Builds the gRPC trailers for a status: `grpc-status`, `grpc-message` and
/// the base64 `grpc-status-details-bin` payload when rich details exist.
pub fn status_to_trailers(status: &Status) -> http::HeaderMap {
    let mut trailers = http::HeaderMap::new();

    trailers.insert(
        "grpc-status",
        http::HeaderValue::from_str(&(status.code() as i32).to_string())
            .unwrap_or(http::HeaderValue::from_static("2")),
    );

    if !status.message().is_empty() {
        let encoded = utf8_percent_encode(status.message(), GRPC_MESSAGE_SET).to_string();
        if let Ok(value) = http::HeaderValue::from_str(&encoded) {
            trailers.insert("grpc-message", value);
        }
    }

    if !status.details().is_empty() {
        let encoded = BASE64_NO_PAD.encode(status.details());
        if let Ok(value) = http::HeaderValue::from_str(&encoded) {
            trailers.insert("grpc-status-details-bin", value);
        }
    }

    trailers
}
