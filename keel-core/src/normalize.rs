//! Error normalization.
//!
//! Handlers fail with a [`HandlerError`]. Before the failure leaves the call
//! boundary it is mapped onto exactly one [`ErrorKind`]: already-classified
//! errors pass through, recognised storage causes get their matching kind, and
//! everything else becomes `Internal`.

use std::error::Error as StdError;

use tonic::Status;

use crate::error::{ClassifiedError, ErrorKind};

pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Failure returned by a call handler.
///
/// The variants are the closed set of causes the normalization stage knows
/// how to classify; [`HandlerError::Other`] is the catch-all.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Already classified; forwarded untouched.
    #[error(transparent)]
    Classified(#[from] ClassifiedError),
    /// The requested document does not exist.
    #[error("{0}")]
    NoDocuments(String),
    /// A write collided with a unique key.
    #[error("{0}")]
    DuplicateKey(String),
    /// The backing operation timed out.
    #[error("{0}")]
    Timeout(String),
    #[error("{0}")]
    Other(#[source] BoxError),
}

impl HandlerError {
    pub fn no_documents(message: impl Into<String>) -> Self {
        HandlerError::NoDocuments(message.into())
    }

    pub fn duplicate_key(message: impl Into<String>) -> Self {
        HandlerError::DuplicateKey(message.into())
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        HandlerError::Timeout(message.into())
    }

    pub fn other(err: impl Into<BoxError>) -> Self {
        HandlerError::Other(err.into())
    }
}

impl From<Status> for HandlerError {
    fn from(status: Status) -> Self {
        HandlerError::Classified(ClassifiedError::from_status(&status))
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::TimedOut {
            HandlerError::Timeout(err.to_string())
        } else {
            HandlerError::Other(Box::new(err))
        }
    }
}

impl From<tokio::time::error::Elapsed> for HandlerError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        HandlerError::Timeout(err.to_string())
    }
}

/// Whether any error in the source chain is a timeout.
fn timed_out(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.is::<tokio::time::error::Elapsed>() {
            return true;
        }
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::TimedOut {
                return true;
            }
        }
        current = e.source();
    }
    false
}

/// Map a handler failure onto its classified form.
///
/// Pure and total: the same cause always yields the same kind, and anything
/// unrecognised ends up as `Internal`. The underlying message is kept verbatim.
pub fn classify(err: HandlerError) -> ClassifiedError {
    match err {
        HandlerError::Classified(classified) => classified,
        HandlerError::NoDocuments(message) => ClassifiedError::not_found(message),
        HandlerError::DuplicateKey(message) => ClassifiedError::already_exists(message),
        HandlerError::Timeout(message) => ClassifiedError::deadline_exceeded(message),
        HandlerError::Other(source) => {
            let kind = if timed_out(source.as_ref()) {
                ErrorKind::DeadlineExceeded
            } else {
                ErrorKind::Internal
            };
            ClassifiedError::new(kind, source.to_string())
        }
    }
}

/// Normalize the outcome of a handler, logging the failure exactly once.
pub fn normalize<T>(result: Result<T, HandlerError>) -> Result<T, ClassifiedError> {
    result.map_err(|err| {
        let classified = classify(err);
        tracing::error!(
            kind = %classified.kind(),
            error = %classified.message(),
            "error interceptor"
        );
        classified
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("query failed")]
    struct QueryError {
        #[source]
        source: std::io::Error,
    }

    #[test]
    fn nested_io_timeout_is_a_deadline() {
        let err = HandlerError::other(QueryError {
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "socket timed out"),
        });
        let classified = classify(err);
        assert_eq!(classified.kind(), ErrorKind::DeadlineExceeded);
        assert_eq!(classified.message(), "query failed");
    }

    #[test]
    fn nested_other_io_is_internal() {
        let err = HandlerError::other(QueryError {
            source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe"),
        });
        assert_eq!(classify(err).kind(), ErrorKind::Internal);
    }

    #[test]
    fn io_timeout_converts_to_timeout_cause() {
        let err: HandlerError =
            std::io::Error::new(std::io::ErrorKind::TimedOut, "read timed out").into();
        assert!(matches!(err, HandlerError::Timeout(_)));
    }
}
