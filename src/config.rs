use std::{num::NonZero, time::Duration};

use clap::{ArgAction, Parser};

// Options consumed by the connection-handling core. A host binary may parse this
// directly or flatten it into its own arguments.
#[derive(Debug, Clone, Parser)]
#[command(version, about, long_about = None)]
pub struct ApplicationConfig {
    /// Close proxied connections that see no traffic for the idle timeout.
    #[arg(long, default_value_t = true, action = ArgAction::Set, value_name = "BOOL")]
    pub idle_connection: bool,

    /// How long a proxied connection may stay idle before being closed.
    #[arg(
        long,
        default_value = "5s",
        value_parser = humantime::parse_duration,
        value_name = "DURATION"
    )]
    pub idle_connection_timeout: Duration,

    /// Log errors that end proxied connections.
    #[arg(long, default_value_t = false)]
    pub debug: bool,

    /// Size of the buffer used by each direction of a relay.
    #[arg(long, default_value_t = 32_768, value_name = "BYTES")]
    pub buffer_size: usize,

    /// How many console messages may be queued for each SSH session.
    #[arg(long, default_value = "100", value_name = "MESSAGES")]
    pub message_buffer_size: NonZero<usize>,

    /// Maximum duration of a proxied TCP connection. Unlimited if missing.
    #[arg(long, value_parser = humantime::parse_duration, value_name = "DURATION")]
    pub tcp_connection_timeout: Option<Duration>,

    /// How long to wait for a TLS ClientHello before dropping the connection.
    #[arg(
        long,
        default_value = "1s",
        value_parser = humantime::parse_duration,
        value_name = "DURATION"
    )]
    pub sni_peek_timeout: Duration,

    /// Don't send new connection notices to the SSH clients.
    #[arg(long, default_value_t = false)]
    pub disable_tcp_logs: bool,
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod application_config_tests {
    use std::time::Duration;

    use clap::Parser;

    use super::ApplicationConfig;

    #[test]
    fn parses_defaults() {
        let config = ApplicationConfig::parse_from(["burrow"]);
        assert!(config.idle_connection);
        assert_eq!(config.idle_connection_timeout, Duration::from_secs(5));
        assert!(!config.debug);
        assert_eq!(config.buffer_size, 32_768);
        assert_eq!(config.message_buffer_size.get(), 100);
        assert!(config.tcp_connection_timeout.is_none());
        assert_eq!(config.sni_peek_timeout, Duration::from_secs(1));
        assert!(!config.disable_tcp_logs);
    }

    #[test]
    fn parses_idle_connection_options() {
        let config = ApplicationConfig::parse_from([
            "burrow",
            "--idle-connection=false",
            "--idle-connection-timeout=250ms",
            "--tcp-connection-timeout=1m",
            "--debug",
        ]);
        assert!(!config.idle_connection);
        assert_eq!(config.idle_connection_timeout, Duration::from_millis(250));
        assert_eq!(config.tcp_connection_timeout, Some(Duration::from_secs(60)));
        assert!(config.debug);
    }

    #[test]
    fn rejects_zero_message_buffer() {
        assert!(ApplicationConfig::try_parse_from(["burrow", "--message-buffer-size=0"]).is_err());
    }

    #[test]
    fn rejects_invalid_duration() {
        assert!(
            ApplicationConfig::try_parse_from(["burrow", "--idle-connection-timeout=soon"])
                .is_err()
        );
    }
}
