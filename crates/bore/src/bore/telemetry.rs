use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub const CONTROL_SESSIONS_TOTAL: &str = "bore_control_sessions_total";
pub const AUTH_FAILURES_TOTAL: &str = "bore_auth_failures_total";
pub const USER_CONNECTIONS_TOTAL: &str = "bore_user_connections_total";
pub const PENDING_EXPIRED_TOTAL: &str = "bore_pending_expired_total";
pub const PENDING_CONNECTIONS: &str = "bore_pending_connections";
pub const RELAY_BYTES_TOTAL: &str = "bore_relay_bytes_total";

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup. Without it the `metrics` macros are
/// no-ops.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")?;
    describe();
    Ok(handle)
}

fn describe() {
    metrics::describe_counter!(CONTROL_SESSIONS_TOTAL, "Control-port connections accepted");
    metrics::describe_counter!(AUTH_FAILURES_TOTAL, "Failed authentication handshakes");
    metrics::describe_counter!(USER_CONNECTIONS_TOTAL, "Public connections accepted on leased ports");
    metrics::describe_counter!(PENDING_EXPIRED_TOTAL, "Public connections closed before being claimed");
    metrics::describe_gauge!(PENDING_CONNECTIONS, "Public connections awaiting a claim");
    metrics::describe_counter!(RELAY_BYTES_TOTAL, metrics::Unit::Bytes, "Bytes relayed");
}
