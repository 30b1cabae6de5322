//! Request validation.
//!
//! Message types declare their structural constraints with `garde`:
//!
//! ```ignore
//! #[derive(garde::Validate)]
//! struct CreateUser {
//!     #[garde(length(min = 1))]
//!     name: String,
//!     #[garde(range(max = 150))]
//!     age: u32,
//! }
//! ```
//!
//! A failing message is rejected with `InvalidArgument` and one
//! [`FieldViolation`] per broken rule, in the order garde evaluated them.

use std::pin::Pin;
use std::task::{ready, Context, Poll};

use futures_core::Stream;
use pin_project_lite::pin_project;

use crate::error::{ClassifiedError, FieldViolation};

pub use garde::Validate;

/// Message returned when a call arrives without a request body.
pub const MISSING_REQUEST: &str = "Request struct is required";

fn convert_garde_report(report: &garde::Report) -> ClassifiedError {
    let violations = report.iter().map(|(path, error)| {
        let field = {
            let s = path.to_string();
            if s.is_empty() { "value".to_string() } else { s }
        };
        FieldViolation::new(field, error.message())
    });
    ClassifiedError::invalid_argument(report.to_string().trim_end()).with_violations(violations)
}

/// Check a single decoded message against its declared constraints.
pub fn validate_message<T>(message: &T) -> Result<(), ClassifiedError>
where
    T: Validate,
    T::Context: Default,
{
    message
        .validate()
        .map_err(|report| convert_garde_report(&report))
}

/// Check an inbound request, rejecting an absent one outright.
pub fn validate_request<T>(request: Option<T>) -> Result<T, ClassifiedError>
where
    T: Validate,
    T::Context: Default,
{
    let request = request.ok_or_else(|| ClassifiedError::invalid_argument(MISSING_REQUEST))?;
    validate_message(&request)?;
    Ok(request)
}

pin_project! {
    /// Inbound stream wrapper that validates every received message.
    ///
    /// An invalid message is replaced by an `InvalidArgument` error item; the
    /// handler never sees its contents. The stream keeps going afterwards, so
    /// a later valid message is delivered normally. Errors from the underlying
    /// stream and end-of-stream pass through unchanged.
    pub struct ValidatingStream<S> {
        #[pin]
        inner: S,
    }
}

impl<S> ValidatingStream<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S, M, E> Stream for ValidatingStream<S>
where
    S: Stream<Item = Result<M, E>>,
    M: Validate,
    M::Context: Default,
    E: From<ClassifiedError>,
{
    type Item = Result<M, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let item = match ready!(this.inner.poll_next(cx)) {
            Some(Ok(message)) => match validate_message(&message) {
                Ok(()) => Some(Ok(message)),
                Err(rejected) => {
                    tracing::debug!(
                        violations = rejected.details().len(),
                        "rejected inbound stream message"
                    );
                    Some(Err(E::from(rejected)))
                }
            },
            other => other,
        };
        Poll::Ready(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
