//! Wire form of [`ClassifiedError`].
//!
//! Field violations travel in the `grpc-status-details-bin` trailer as a
//! `google.rpc.Status` whose details hold one `google.rpc.BadRequest`, the same
//! layout every gRPC client library knows how to unpack.

use bytes::Bytes;
use prost::Message;
use tonic::Status;

use crate::error::{ClassifiedError, ErrorKind, FieldViolation};

const BAD_REQUEST_TYPE_URL: &str = "type.googleapis.com/google.rpc.BadRequest";

#[derive(Clone, PartialEq, Message)]
struct RpcStatus {
    #[prost(int32, tag = "1")]
    code: i32,
    #[prost(string, tag = "2")]
    message: String,
    #[prost(message, repeated, tag = "3")]
    details: Vec<ProtoAny>,
}

#[derive(Clone, PartialEq, Message)]
struct ProtoAny {
    #[prost(string, tag = "1")]
    type_url: String,
    #[prost(bytes = "vec", tag = "2")]
    value: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
struct BadRequest {
    #[prost(message, repeated, tag = "1")]
    field_violations: Vec<BadRequestFieldViolation>,
}

#[derive(Clone, PartialEq, Message)]
struct BadRequestFieldViolation {
    #[prost(string, tag = "1")]
    field: String,
    #[prost(string, tag = "2")]
    description: String,
}

/// Encode a message into a fresh buffer.
///
/// Encoding into a `Vec` sized from `encoded_len` cannot run out of space, so
/// a failure here means the status details are corrupt and the process must
/// not carry on as if the caller had been told why their request failed.
fn encode_or_abort<M: Message>(message: &M) -> Vec<u8> {
    let mut buf = Vec::with_capacity(message.encoded_len());
    if let Err(err) = message.encode(&mut buf) {
        panic!("unexpected error attaching status details: {err}");
    }
    buf
}

fn encode_details(error: &ClassifiedError) -> Bytes {
    let bad_request = BadRequest {
        field_violations: error
            .details()
            .iter()
            .map(|v| BadRequestFieldViolation {
                field: v.field.clone(),
                description: v.description.clone(),
            })
            .collect(),
    };
    let status = RpcStatus {
        code: error.kind().code() as i32,
        message: error.message().to_string(),
        details: vec![ProtoAny {
            type_url: BAD_REQUEST_TYPE_URL.to_string(),
            value: encode_or_abort(&bad_request),
        }],
    };
    Bytes::from(encode_or_abort(&status))
}

fn decode_violations(details: &[u8]) -> Vec<FieldViolation> {
    let Ok(status) = RpcStatus::decode(details) else {
        return Vec::new();
    };
    status
        .details
        .iter()
        .filter(|any| any.type_url == BAD_REQUEST_TYPE_URL)
        .filter_map(|any| BadRequest::decode(any.value.as_slice()).ok())
        .flat_map(|br| br.field_violations)
        .map(|v| FieldViolation::new(v.field, v.description))
        .collect()
}

impl ClassifiedError {
    /// Rebuild a classified error from a status received over the wire,
    /// including any `BadRequest` field violations it carries.
    pub fn from_status(status: &Status) -> Self {
        let error = ClassifiedError::new(ErrorKind::from(status.code()), status.message());
        if status.details().is_empty() {
            error
        } else {
            error.with_violations(decode_violations(status.details()))
        }
    }

    pub fn into_status(self) -> Status {
        Status::from(self)
    }
}

impl From<ClassifiedError> for Status {
    fn from(error: ClassifiedError) -> Self {
        let code = error.kind().code();
        if error.details().is_empty() {
            Status::new(code, error.message())
        } else {
            let details = encode_details(&error);
            Status::with_details(code, error.message(), details)
        }
    }
}

impl From<Status> for ClassifiedError {
    fn from(status: Status) -> Self {
        ClassifiedError::from_status(&status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_without_violations_has_no_details() {
        let status = Status::from(ClassifiedError::not_found("no such user"));
        assert_eq!(status.code(), tonic::Code::NotFound);
        assert_eq!(status.message(), "no such user");
        assert!(status.details().is_empty());
    }

    #[test]
    fn violations_survive_the_wire() {
        let error = ClassifiedError::invalid_argument("bad request")
            .with_violation("name", "length is lower than 1")
            .with_violation("age", "greater than 150");
        let status = error.clone().into_status();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let decoded = ClassifiedError::from_status(&status);
        assert_eq!(decoded, error);
    }

    #[test]
    fn garbage_details_are_ignored() {
        let status = Status::with_details(
            tonic::Code::InvalidArgument,
            "bad",
            Bytes::from_static(b"\xff\xff\xff"),
        );
        let decoded = ClassifiedError::from_status(&status);
        assert_eq!(decoded.kind(), ErrorKind::InvalidArgument);
        assert!(decoded.details().is_empty());
    }
}
