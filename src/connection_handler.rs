use std::{future::Future, net::IpAddr};

use tokio::io::{AsyncRead, AsyncWrite};

// Trait for creating the client-side channel of a forwarded connection (via an
// underlying SSH session).
pub trait ConnectionHandler: Send + Sync + 'static {
    type Channel: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    // Return a tunneling channel for a connection coming from the given address.
    fn tunneling_channel(
        &self,
        ip: IpAddr,
        port: u16,
    ) -> impl Future<Output = color_eyre::Result<Self::Channel>> + Send;
}

// Handler for tests, returning one end of an in-memory pipe for every channel
// and handing the other end to the test.
#[cfg(test)]
pub(crate) struct DuplexHandler {
    pub(crate) tx: tokio::sync::mpsc::UnboundedSender<(IpAddr, u16, tokio::io::DuplexStream)>,
    pub(crate) fail: bool,
}

#[cfg(test)]
impl DuplexHandler {
    pub(crate) fn new() -> (
        Self,
        tokio::sync::mpsc::UnboundedReceiver<(IpAddr, u16, tokio::io::DuplexStream)>,
    ) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (DuplexHandler { tx, fail: false }, rx)
    }
}

#[cfg(test)]
impl ConnectionHandler for DuplexHandler {
    type Channel = tokio::io::DuplexStream;

    fn tunneling_channel(
        &self,
        ip: IpAddr,
        port: u16,
    ) -> impl Future<Output = color_eyre::Result<Self::Channel>> + Send {
        let result = if self.fail {
            Err(color_eyre::eyre::eyre!("tunneling not allowed"))
        } else {
            let (local, remote) = tokio::io::duplex(64 * 1024);
            self.tx
                .send((ip, port, remote))
                .map(|_| local)
                .map_err(|_| color_eyre::eyre::eyre!("test receiver dropped"))
        };
        async move { result }
    }
}
