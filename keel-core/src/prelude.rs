//! Keel prelude: the types a service implementation touches.
//!
//! ```ignore
//! use keel_core::prelude::*;
//!
//! async fn get_user(&self, request: tonic::Request<GetUser>) -> Result<tonic::Response<User>, Status> {
//!     PIPELINE.unary_grpc(&GET_USER, request, |req| async move {
//!         self.store.find(&req.id).await.map_err(HandlerError::other)
//!     }).await
//! }
//! ```

pub use crate::error::{ClassifiedError, ErrorKind, FieldViolation};
pub use crate::interceptors::{CallInfo, CallKind, Pipeline};
pub use crate::normalize::HandlerError;
pub use crate::validation::{Validate, ValidatingStream};

pub use tonic::Status;
