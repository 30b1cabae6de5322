pub mod config;
pub mod error;
pub mod health;
pub mod interceptors;
pub mod lifecycle;
pub mod logging;
pub mod normalize;
pub mod prelude;
mod status;
pub mod supervisor;
pub mod validation;

pub use config::{ConfigError, ConfigProperties, ConfigValue, FromConfigValue, KeelConfig};
pub use error::{ClassifiedError, ErrorKind, FieldViolation};
pub use health::{HealthRegistry, HealthSink, ServingState, OVERALL};
pub use interceptors::{AccessLog, CallInfo, CallKind, Interceptor, Pipeline, Recovery};
pub use lifecycle::{
    LifecycleError, LifecycleState, Server, ServerHandle, Transport, TransportError,
};
pub use logging::{init_tracing, LogConfig, LogFormat};
pub use normalize::{classify, normalize, BoxError, HandlerError};
pub use supervisor::{
    start, ExitStatus, LifecycleConfig, ShutdownCause, SignalKind, SignalListener, Supervisor,
    SupervisorError, DEFAULT_GRACE_PERIOD,
};
pub use validation::{validate_message, validate_request, Validate, ValidatingStream};

pub use tokio_util::sync::CancellationToken;
