//! Test utilities for Keel.
//!
//! [`TestTransport`] stands in for a network transport so the lifecycle
//! coordinator and supervisor can be driven deterministically: calls are
//! futures started through a [`TestClient`], and every health change and
//! accept-loop transition is recorded as a [`TransportEvent`].

mod transport;

pub use transport::{
    CallOutcome, CallRejected, InFlightCall, TestClient, TestTransport, TransportEvent,
};
