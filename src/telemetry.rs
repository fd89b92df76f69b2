// Metric names and labels.

pub(crate) const TELEMETRY_COUNTER_TCP_CONNECTIONS_TOTAL: &str = "burrow_tcp_connections_total";
pub(crate) const TELEMETRY_COUNTER_SNI_CONNECTIONS_TOTAL: &str = "burrow_sni_connections_total";
pub(crate) const TELEMETRY_GAUGE_SSH_SESSIONS_CURRENT: &str = "burrow_ssh_sessions_current";

pub(crate) const TELEMETRY_KEY_PORT: &str = "port";
pub(crate) const TELEMETRY_KEY_HOSTNAME: &str = "hostname";
