//! Observability components

pub mod health_checks;

pub use health_checks::{
    CheckOptions, HealthCheckConfig, HealthCheckManager, HealthCheckResult, HealthProbe,
    HealthReport, HealthStatus, HealthSummary, ProbeReport,
};
