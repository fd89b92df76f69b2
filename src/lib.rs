#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Connection-handling core for an SSH reverse-tunnel proxy.
//!
//! Each accepted SSH connection gets an [`SshSession`], which owns its forwarded
//! listeners and a bounded queue of notices for the client. Proxied connections
//! are joined to the client-side channel with [`copy_both`], optionally wrapped
//! in an [`IdleTimeoutStream`]. Raw TLS connections can be routed by SNI with
//! [`SniProxy`], which peeks the ClientHello through a [`TeeReader`] and replays
//! it untouched.

pub mod config;
pub mod connection_handler;
pub mod error;
pub mod idle;
pub mod listener;
pub mod relay;
pub mod session;
pub mod sni;
pub mod ssh;
pub mod tcp;
pub mod tee;
pub(crate) mod telemetry;
pub mod tls;

pub use config::ApplicationConfig;
pub use connection_handler::ConnectionHandler;
pub use error::ServerError;
pub use idle::IdleTimeoutStream;
pub use listener::ForwardedListener;
pub use relay::{RelayOptions, copy_both};
pub use session::{
    ProxyProtocol, SessionConnection, SessionModes, SessionRegistry, SessionTracker, SetupGuard,
    SshSession,
};
pub use sni::{SniOutcome, SniProxy};
pub use ssh::{RusshConnection, SshTunnelHandler, serve_console};
pub use tcp::TcpForwarder;
pub use tee::{ReplayStream, TeeReader};
pub use tls::{TlsHello, peek_tls_hello};
