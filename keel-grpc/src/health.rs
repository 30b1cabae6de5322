use keel_core::{HealthSink, ServingState};
use tonic_health::server::HealthReporter;
use tonic_health::ServingStatus;

/// Mirrors the health registry into the standard `grpc.health.v1.Health`
/// service.
#[derive(Clone)]
pub struct ReporterSink {
    reporter: HealthReporter,
}

impl ReporterSink {
    pub fn new(reporter: HealthReporter) -> Self {
        Self { reporter }
    }
}

/// Wire status for a registry state. Anything not actively serving, draining
/// included, is reported as `NOT_SERVING`.
pub fn wire_status(state: ServingState) -> ServingStatus {
    match state {
        ServingState::Unknown => ServingStatus::Unknown,
        ServingState::Serving => ServingStatus::Serving,
        ServingState::NotServing | ServingState::Draining | ServingState::Stopped => {
            ServingStatus::NotServing
        }
    }
}

impl HealthSink for ReporterSink {
    async fn publish(&self, service: &str, state: ServingState) {
        self.reporter
            .set_service_status(service, wire_status(state))
            .await;
    }
}
