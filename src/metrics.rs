//! Prometheus metrics, exposed by the control API at /metrics.

use lazy_static::lazy_static;
use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    /// Total connections per service
    pub static ref SERVICE_CONNECTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("viaduct_service_connections_total", "Total connections per service"),
        &["service"]
    ).unwrap();

    /// Active connections per service
    pub static ref SERVICE_CONNECTIONS_ACTIVE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("viaduct_service_connections_active", "Active connections per service"),
        &["service"]
    ).unwrap();

    /// Bytes received from clients per service
    pub static ref SERVICE_BYTES_IN: IntCounterVec = IntCounterVec::new(
        Opts::new("viaduct_service_bytes_in_total", "Bytes read from clients per service"),
        &["service"]
    ).unwrap();

    /// Bytes sent to clients per service
    pub static ref SERVICE_BYTES_OUT: IntCounterVec = IntCounterVec::new(
        Opts::new("viaduct_service_bytes_out_total", "Bytes written to clients per service"),
        &["service"]
    ).unwrap();

    /// Handler errors per service
    pub static ref SERVICE_HANDLER_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("viaduct_service_handler_errors_total", "Handler errors per service"),
        &["service"]
    ).unwrap();

    /// Chain dial failures per chain
    pub static ref CHAIN_DIAL_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("viaduct_chain_dial_failures_total", "Dial failures per chain"),
        &["chain"]
    ).unwrap();
}

/// Register all metric families. Safe to call once at startup.
pub fn init_metrics() {
    let _ = REGISTRY.register(Box::new(SERVICE_CONNECTIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(SERVICE_CONNECTIONS_ACTIVE.clone()));
    let _ = REGISTRY.register(Box::new(SERVICE_BYTES_IN.clone()));
    let _ = REGISTRY.register(Box::new(SERVICE_BYTES_OUT.clone()));
    let _ = REGISTRY.register(Box::new(SERVICE_HANDLER_ERRORS.clone()));
    let _ = REGISTRY.register(Box::new(CHAIN_DIAL_FAILURES.clone()));
}
