//! gRPC wire framing: the 5-byte message prefix and a response body that
//! carries HTTP/2 trailers.

use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{BufMut, Bytes, BytesMut};
use http_body::{Body, Frame};
use tonic::{Code, Status};

/// Encodes one message payload as a length-prefixed, uncompressed gRPC
/// frame.
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(payload.len() + 5);
    frame.put_u8(0);
    frame.put_u32(payload.len() as u32);
    frame.put_slice(payload);
    frame.freeze()
}

/// Decodes the first frame of a unary request body. Compressed frames are
/// not supported.
pub fn decode_frame(buf: &[u8]) -> Result<Bytes, Status> {
    if buf.len() < 5 {
        return Err(Status::new(
            Code::InvalidArgument,
            "gRPC frame shorter than the message prefix",
        ));
    }

    if buf[0] != 0 {
        return Err(Status::new(
            Code::Unimplemented,
            "compressed gRPC messages are not supported",
        ));
    }

    let length = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    if buf.len() < 5 + length {
        return Err(Status::new(
            Code::InvalidArgument,
            "gRPC frame truncated",
        ));
    }

    Ok(Bytes::copy_from_slice(&buf[5..5 + length]))
}

/// Response body for the hand-rolled gRPC server: an optional message frame
/// followed by the status trailers.
pub struct GrpcBody {
    data: Option<Bytes>,
    trailers: Option<http::HeaderMap>,
}

impl GrpcBody {
    pub fn new(data: Option<Bytes>, trailers: http::HeaderMap) -> Self {
        Self {
            data,
            trailers: Some(trailers),
        }
    }
}

impl Body for GrpcBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        if let Some(data) = this.data.take() {
            return Poll::Ready(Some(Ok(Frame::data(data))));
        }

        if let Some(trailers) = this.trailers.take() {
            return Poll::Ready(Some(Ok(Frame::trailers(trailers))));
        }

        Poll::Ready(None)
    }

    fn is_end_stream(&self) -> bool {
        self.data.is_none() && self.trailers.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grpc::descriptor::test_descriptor;

    #[test]
    fn test_frame_round_trip() {
        let descriptor = test_descriptor();
        let method = descriptor
            .get_method("/offers.v1.OfferService/ValidateOffer")
            .unwrap();

        let message = prost_reflect::DynamicMessage::deserialize(
            method.input(),
            serde_json::json!({"request_id": "R1"}),
        )
        .unwrap();

        let frame = encode_frame(&prost::Message::encode_to_vec(&message));
        assert_eq!(frame[0], 0);

        let payload = decode_frame(&frame).unwrap();
        let decoded = prost_reflect::DynamicMessage::decode(method.input(), payload).unwrap();
        assert_eq!(message, decoded);
    }

    #[test]
    fn test_decode_frame_rejects_compression() {
        let err = decode_frame(&[1, 0, 0, 0, 0]).unwrap_err();
        assert_eq!(err.code(), Code::Unimplemented);
    }

    #[test]
    fn test_decode_frame_rejects_short_input() {
        assert!(decode_frame(&[0, 0]).is_err());
        assert!(decode_frame(&[0, 0, 0, 0, 9, 1]).is_err());
    }
}
