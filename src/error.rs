use std::io;

#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    #[error("Session is already closed")]
    SessionClosed,
    #[error("Console messages are already being forwarded")]
    MessagesAlreadyTaken,
    #[error("Operation not valid on a tee reader")]
    InvalidTeeOperation,
    #[error("No TLS ClientHello received: {0}")]
    MissingClientHello(#[source] io::Error),
    #[error("Timed out waiting for TLS ClientHello")]
    ClientHelloTimeout,
    #[error("Error closing SSH connection")]
    ConnectionCloseFailed,
}
