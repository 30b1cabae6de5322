//! Tower layers wrapped around every inbound call on the server, outermost
//! first: panic recovery, then the access log.
//!
//! Validation and error normalization stay typed and per method, see
//! [`keel_core::Pipeline`].

use std::any::Any;
use std::time::Duration;

use keel_core::interceptors::panic_message;
use keel_core::{ClassifiedError, ErrorKind};
use tonic::body::Body;
use tonic::codegen::http::{self, header, HeaderMap, HeaderValue};
use tonic::{Code, Status};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::classify::{GrpcErrorsAsFailures, GrpcFailureClass, SharedClassifier};
use tower_http::trace::{MakeSpan, OnEos, OnFailure, TraceLayer};
use tracing::{Level, Span};

pub type RecoveryLayer =
    CatchPanicLayer<fn(Box<dyn Any + Send + 'static>) -> http::Response<Body>>;

pub type AccessLogLayer =
    TraceLayer<SharedClassifier<GrpcErrorsAsFailures>, CallSpan, (), (), (), CallOutcome, CallOutcome>;

/// Turns a panic in a handler into an `INTERNAL` status for that call only.
pub fn recovery_layer() -> RecoveryLayer {
    CatchPanicLayer::custom(panic_response as fn(_) -> _)
}

/// Logs one `finished call` event per call with its gRPC code and latency.
pub fn access_log_layer() -> AccessLogLayer {
    TraceLayer::new_for_grpc()
        .make_span_with(CallSpan)
        .on_request(())
        .on_response(())
        .on_body_chunk(())
        .on_eos(CallOutcome)
        .on_failure(CallOutcome)
}

fn panic_response(payload: Box<dyn Any + Send + 'static>) -> http::Response<Body> {
    let reason = panic_message(payload.as_ref());
    tracing::error!(panic = %reason, "recovered from panic in call handler");
    grpc_error_response(&Status::from(ClassifiedError::internal(reason)))
}

/// A trailers-only gRPC response carrying `status`.
fn grpc_error_response(status: &Status) -> http::Response<Body> {
    let mut response = http::Response::new(Body::empty());
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
    if let Err(err) = status.add_header(headers) {
        tracing::error!(error = %err, "failed to encode status headers");
        headers.insert("grpc-status", HeaderValue::from(Code::Internal as i32));
    }
    response
}

/// `/package.Service/Method` split into service and method.
fn split_path(path: &str) -> (&str, &str) {
    let path = path.trim_start_matches('/');
    path.split_once('/').unwrap_or((path, ""))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CallSpan;

impl<B> MakeSpan<B> for CallSpan {
    fn make_span(&mut self, request: &http::Request<B>) -> Span {
        let (service, method) = split_path(request.uri().path());
        tracing::info_span!("grpc_call", grpc.service = service, grpc.method = method)
    }
}

/// Records how a call ended. Failures arrive through [`OnFailure`], clean
/// completions through the `grpc-status: 0` trailer.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOutcome;

fn millis(latency: Duration) -> u64 {
    latency.as_millis() as u64
}

impl OnEos for CallOutcome {
    fn on_eos(self, trailers: Option<&HeaderMap>, stream_duration: Duration, span: &Span) {
        let ok = trailers
            .and_then(|trailers| trailers.get("grpc-status"))
            .is_some_and(|status| status.as_bytes() == b"0");
        if ok {
            span.in_scope(|| {
                tracing::info!(grpc.code = "OK", elapsed_ms = millis(stream_duration), "finished call")
            });
        }
    }
}

impl OnFailure<GrpcFailureClass> for CallOutcome {
    fn on_failure(&mut self, failure: GrpcFailureClass, latency: Duration, span: &Span) {
        let elapsed_ms = millis(latency);
        span.in_scope(|| match failure {
            GrpcFailureClass::Code(code) => {
                let kind = ErrorKind::from(Code::from_i32(code.get()));
                log_failed_call(kind, elapsed_ms);
            }
            GrpcFailureClass::Error(error) => {
                tracing::error!(error = %error, elapsed_ms, "call failed");
            }
        });
    }
}

fn log_failed_call(kind: ErrorKind, elapsed_ms: u64) {
    let code = kind.as_str();
    let level = kind.log_level();
    if level == Level::ERROR {
        tracing::error!(grpc.code = code, elapsed_ms, "finished call");
    } else if level == Level::WARN {
        tracing::warn!(grpc.code = code, elapsed_ms, "finished call");
    } else {
        tracing::info!(grpc.code = code, elapsed_ms, "finished call");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_path_separates_service_and_method() {
        assert_eq!(
            split_path("/grpc.health.v1.Health/Check"),
            ("grpc.health.v1.Health", "Check")
        );
        assert_eq!(split_path("/odd"), ("odd", ""));
    }

    #[test]
    fn panic_becomes_trailers_only_internal() {
        let response = panic_response(Box::new("boom"));
        let headers = response.headers();
        assert_eq!(headers.get("grpc-status").unwrap(), "13");
        assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "application/grpc");
        let status = Status::from_header_map(headers).unwrap();
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(status.message(), "boom");
    }
}
