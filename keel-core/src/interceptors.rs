//! Per-call interceptor chain.
//!
//! Every call runs through the same fixed pipeline, outermost first:
//!
//! 1. [`Recovery`] turns a panic anywhere inside into an `Internal` error.
//! 2. [`AccessLog`] records the outcome without altering it.
//! 3. Error normalization maps the handler failure onto an [`ErrorKind`](crate::ErrorKind).
//! 4. Validation rejects malformed input before the handler is invoked.
//!
//! [`Pipeline`] wires these together for unary and streaming calls.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Instant;

use futures_core::Stream;
use futures_util::FutureExt;
use tonic::Status;

use crate::error::ClassifiedError;
use crate::normalize::{normalize, HandlerError};
use crate::validation::{validate_request, Validate, ValidatingStream};

/// Shape of an RPC method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Unary,
    ClientStreaming,
    ServerStreaming,
    BidiStreaming,
}

impl CallKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CallKind::Unary => "unary",
            CallKind::ClientStreaming => "client_stream",
            CallKind::ServerStreaming => "server_stream",
            CallKind::BidiStreaming => "bidi_stream",
        }
    }
}

/// Static description of the call being intercepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallInfo {
    /// Fully qualified service name, e.g. `"users.v1.UserService"`.
    pub service: &'static str,
    pub method: &'static str,
    pub kind: CallKind,
}

impl CallInfo {
    pub const fn unary(service: &'static str, method: &'static str) -> Self {
        Self {
            service,
            method,
            kind: CallKind::Unary,
        }
    }

    pub const fn streaming(service: &'static str, method: &'static str, kind: CallKind) -> Self {
        Self {
            service,
            method,
            kind,
        }
    }

    /// The `/service/method` path used on the wire.
    pub fn full_method(&self) -> String {
        format!("/{}/{}", self.service, self.method)
    }
}

/// Generic interceptor with an `around` pattern.
///
/// Each interceptor wraps the next computation; interceptors compose by
/// nesting, the outermost one calling `next()` to run everything inside it.
#[diagnostic::on_unimplemented(
    message = "`{Self}` does not implement `Interceptor<{R}>`",
    label = "this type cannot be used as an interceptor"
)]
pub trait Interceptor<R> {
    fn around<F, Fut>(&self, call: &CallInfo, next: F) -> impl Future<Output = R> + Send
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = R> + Send;
}

/// Converts a panic inside the wrapped call into a classified `Internal` error.
#[derive(Debug, Clone, Copy, Default)]
pub struct Recovery;

/// Text carried by a panic payload, if it is a string.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

impl<T: Send> Interceptor<Result<T, ClassifiedError>> for Recovery {
    fn around<F, Fut>(
        &self,
        call: &CallInfo,
        next: F,
    ) -> impl Future<Output = Result<T, ClassifiedError>> + Send
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, ClassifiedError>> + Send,
    {
        async move {
            match AssertUnwindSafe(async move { next().await })
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(payload) => {
                    let reason = panic_message(payload.as_ref());
                    tracing::error!(
                        grpc.service = call.service,
                        grpc.method = call.method,
                        panic = %reason,
                        "recovered from panic in call handler"
                    );
                    Err(ClassifiedError::internal(reason))
                }
            }
        }
    }
}

/// Records the outcome of every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessLog;

impl<T: Send> Interceptor<Result<T, ClassifiedError>> for AccessLog {
    fn around<F, Fut>(
        &self,
        call: &CallInfo,
        next: F,
    ) -> impl Future<Output = Result<T, ClassifiedError>> + Send
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, ClassifiedError>> + Send,
    {
        async move {
            let started = Instant::now();
            let result = next().await;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            match &result {
                Ok(_) => tracing::info!(
                    grpc.service = call.service,
                    grpc.method = call.method,
                    grpc.kind = call.kind.as_str(),
                    grpc.code = "OK",
                    elapsed_ms,
                    "finished call"
                ),
                Err(err) => log_failure(call, err, elapsed_ms),
            }
            result
        }
    }
}

fn log_failure(call: &CallInfo, err: &ClassifiedError, elapsed_ms: u64) {
    let level = err.kind().log_level();
    if level == tracing::Level::ERROR {
        tracing::error!(
            grpc.service = call.service,
            grpc.method = call.method,
            grpc.kind = call.kind.as_str(),
            grpc.code = err.kind().as_str(),
            error = %err.message(),
            elapsed_ms,
            "finished call"
        );
    } else if level == tracing::Level::WARN {
        tracing::warn!(
            grpc.service = call.service,
            grpc.method = call.method,
            grpc.kind = call.kind.as_str(),
            grpc.code = err.kind().as_str(),
            error = %err.message(),
            elapsed_ms,
            "finished call"
        );
    } else {
        tracing::info!(
            grpc.service = call.service,
            grpc.method = call.method,
            grpc.kind = call.kind.as_str(),
            grpc.code = err.kind().as_str(),
            error = %err.message(),
            elapsed_ms,
            "finished call"
        );
    }
}

/// The assembled interceptor chain.
///
/// Cheap to clone and share between service implementations; a panic in one
/// call leaves the pipeline usable for the next.
#[derive(Debug, Clone, Copy, Default)]
pub struct Pipeline {
    recovery: Recovery,
    access_log: AccessLog,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a unary call: validate the request, invoke the handler, normalize
    /// its failure. A rejected request never reaches the handler.
    pub async fn unary<Req, Resp, H, Fut>(
        &self,
        call: &CallInfo,
        request: Option<Req>,
        handler: H,
    ) -> Result<Resp, ClassifiedError>
    where
        Req: Validate + Send,
        Req::Context: Default,
        Resp: Send,
        H: FnOnce(Req) -> Fut + Send,
        Fut: Future<Output = Result<Resp, HandlerError>> + Send,
    {
        self.recovery
            .around(call, || {
                self.access_log.around(call, || async move {
                    let outcome = match validate_request(request) {
                        Ok(request) => handler(request).await,
                        Err(rejected) => Err(HandlerError::from(rejected)),
                    };
                    normalize(outcome)
                })
            })
            .await
    }

    /// Run a streaming call. The handler receives the inbound stream wrapped
    /// so that every message is validated as it is received.
    pub async fn streaming<S, M, E, Resp, H, Fut>(
        &self,
        call: &CallInfo,
        inbound: S,
        handler: H,
    ) -> Result<Resp, ClassifiedError>
    where
        S: Stream<Item = Result<M, E>> + Send,
        M: Validate,
        M::Context: Default,
        E: From<ClassifiedError>,
        Resp: Send,
        H: FnOnce(ValidatingStream<S>) -> Fut + Send,
        Fut: Future<Output = Result<Resp, HandlerError>> + Send,
    {
        self.recovery
            .around(call, || {
                self.access_log.around(call, || async move {
                    normalize(handler(ValidatingStream::new(inbound)).await)
                })
            })
            .await
    }

    /// [`unary`](Self::unary) for a tonic service method.
    pub async fn unary_grpc<Req, Resp, H, Fut>(
        &self,
        call: &CallInfo,
        request: tonic::Request<Req>,
        handler: H,
    ) -> Result<tonic::Response<Resp>, Status>
    where
        Req: Validate + Send,
        Req::Context: Default,
        Resp: Send,
        H: FnOnce(Req) -> Fut + Send,
        Fut: Future<Output = Result<Resp, HandlerError>> + Send,
    {
        self.unary(call, Some(request.into_inner()), handler)
            .await
            .map(tonic::Response::new)
            .map_err(Status::from)
    }

    /// [`streaming`](Self::streaming) for a tonic service method whose
    /// request is a stream, e.g. `tonic::Streaming<M>`.
    pub async fn streaming_grpc<S, M, Resp, H, Fut>(
        &self,
        call: &CallInfo,
        request: tonic::Request<S>,
        handler: H,
    ) -> Result<tonic::Response<Resp>, Status>
    where
        S: Stream<Item = Result<M, Status>> + Send,
        M: Validate,
        M::Context: Default,
        Resp: Send,
        H: FnOnce(ValidatingStream<S>) -> Fut + Send,
        Fut: Future<Output = Result<Resp, HandlerError>> + Send,
    {
        self.streaming(call, request.into_inner(), handler)
            .await
            .map(tonic::Response::new)
            .map_err(Status::from)
    }
}
