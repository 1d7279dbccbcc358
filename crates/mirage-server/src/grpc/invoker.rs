//! Dynamic unary invocation against a real upstream, driven by method
//! descriptors instead of generated client code.

use std::time::Duration;

use prost_reflect::{DynamicMessage, MessageDescriptor};
use tonic::client::Grpc;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::metadata::MetadataMap;
use tonic::transport::Endpoint;
use tonic::{Code, Request, Response, Status};
use tracing::{error, info};

/// Codec moving dynamic messages over the wire; the descriptors come from
/// the uploaded bundle.
#[derive(Clone)]
pub struct DynamicCodec {
    request: MessageDescriptor,
    response: MessageDescriptor,
}

impl DynamicCodec {
    pub fn new(request: MessageDescriptor, response: MessageDescriptor) -> Self {
        Self { request, response }
    }
}

impl Codec for DynamicCodec {
    type Encode = DynamicMessage;
    type Decode = DynamicMessage;
    type Encoder = DynamicEncoder;
    type Decoder = DynamicDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        DynamicEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        DynamicDecoder {
            descriptor: self.response.clone(),
        }
    }
}

pub struct DynamicEncoder;

impl Encoder for DynamicEncoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        prost::Message::encode(&item, dst)
            .map_err(|e| Status::internal(format!("cannot encode message: {e}")))
    }
}

pub struct DynamicDecoder {
    descriptor: MessageDescriptor,
}

impl Decoder for DynamicDecoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        let message = DynamicMessage::decode(self.descriptor.clone(), src)
            .map_err(|e| Status::internal(format!("cannot decode message: {e}")))?;
        Ok(Some(message))
    }
}

const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Invokes a unary method on the target server with a fresh connection.
/// Connections are one-per-request, which is acceptable for mock traffic;
/// pooling would change metadata propagation under load.
pub async fn invoke_unary(
    target_url: &str,
    method: &prost_reflect::MethodDescriptor,
    input: DynamicMessage,
    metadata: MetadataMap,
) -> Result<Response<DynamicMessage>, Status> {
    let endpoint = Endpoint::from_shared(normalize_target(target_url))
        .map_err(|e| Status::new(Code::InvalidArgument, format!("invalid target url: {e}")))?
        .connect_timeout(DIAL_TIMEOUT);

    let channel = endpoint.connect().await.map_err(|e| {
        error!("cannot dial {target_url}: {e}");
        Status::new(Code::Unavailable, format!("cannot dial target: {e}"))
    })?;

    let mut client = Grpc::new(channel);
    client
        .ready()
        .await
        .map_err(|e| Status::new(Code::Unavailable, format!("target not ready: {e}")))?;

    let full_method = format!("/{}/{}", method.parent_service().full_name(), method.name());
    let path = full_method
        .parse::<http::uri::PathAndQuery>()
        .map_err(|e| Status::new(Code::InvalidArgument, format!("invalid method path: {e}")))?;

    info!("invoking {full_method} on {target_url}");

    let mut request = Request::new(input);
    *request.metadata_mut() = metadata;

    let codec = DynamicCodec::new(method.input(), method.output());
    client.unary(request, path, codec).await
}

/// The target may be a bare `host:port`; the channel needs a scheme.
fn normalize_target(target: &str) -> String {
    if target.starts_with("http://") || target.starts_with("https://") {
        target.to_string()
    } else {
        format!("http://{target}")
    }
}
