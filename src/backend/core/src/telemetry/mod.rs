//! Telemetry: structured logging infrastructure.
//!
//! Metrics are recorded throughout the crate via the `metrics` facade;
//! installing a recorder/exporter is the host application's concern.

pub mod logging;

pub use logging::{init_logging, LogFormat, LoggingConfig};
