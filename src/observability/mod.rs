//! Observability: structured logging, connection metrics and the status
//! server.

pub mod logging;
pub mod metrics;
pub mod server;

pub use logging::{
    init_default_logging, init_logging, init_test_logging, LogFormat, LoggingConfig,
};
pub use metrics::{ConnectionMetrics, MetricsRecorder};
pub use server::StatusServer;

pub use logging::{command_span, connect_span};
