use std::{
    future::Future,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use russh::{
    Channel, ChannelStream,
    server::{Handle, Msg},
};
#[cfg(not(coverage_nightly))]
use tracing::debug;

use crate::{
    connection_handler::ConnectionHandler,
    error::ServerError,
    session::{SessionConnection, SshSession},
};

// Accepted SSH connection, as seen by its session.
#[derive(Clone)]
pub struct RusshConnection {
    // Handle to the SSH connection, used to disconnect it.
    handle: Handle,
    // IP and port of the SSH connection.
    peer: SocketAddr,
    // Authenticated user.
    user: String,
}

impl RusshConnection {
    pub fn new(handle: Handle, peer: SocketAddr, user: impl Into<String>) -> Self {
        RusshConnection {
            handle,
            peer,
            user: user.into(),
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl SessionConnection for RusshConnection {
    fn remote_addr(&self) -> SocketAddr {
        self.peer
    }

    fn user(&self) -> &str {
        &self.user
    }

    fn close(&self) -> impl Future<Output = color_eyre::Result<()>> + Send + 'static {
        let handle = self.handle.clone();
        async move {
            handle
                .disconnect(
                    russh::Disconnect::ByApplication,
                    "".into(),
                    "English".into(),
                )
                .await
                .map_err(|_| ServerError::ConnectionCloseFailed)?;
            Ok(())
        }
    }
}

// Opens forwarded-tcpip channels to the SSH client for one remote forwarding.
#[derive(Clone)]
pub struct SshTunnelHandler {
    // Handle to the SSH connection, in order to create remote forwarding channels.
    handle: Handle,
    // Address used for the remote forwarding, required for the client to open the correct session channels.
    address: String,
    // Port used for the remote forwarding, required for the client to open the correct session channels.
    port: u32,
}

impl SshTunnelHandler {
    pub fn new(handle: Handle, address: impl Into<String>, port: u32) -> Self {
        SshTunnelHandler {
            handle,
            address: address.into(),
            port,
        }
    }
}

impl ConnectionHandler for SshTunnelHandler {
    type Channel = ChannelStream<Msg>;

    fn tunneling_channel(
        &self,
        ip: IpAddr,
        port: u16,
    ) -> impl Future<Output = color_eyre::Result<Self::Channel>> + Send {
        let handle = self.handle.clone();
        let address = self.address.clone();
        let forwarded_port = self.port;
        async move {
            let channel = handle
                .channel_open_forwarded_tcpip(address, forwarded_port, ip.to_string(), port.into())
                .await?
                .into_stream();
            Ok(channel)
        }
    }
}

// Serve the session channel opened by the SSH client: mark the session phase,
// then stream the session's notices to the client until the session closes.
pub async fn serve_console(
    session: Arc<SshSession<RusshConnection>>,
    channel: Channel<Msg>,
) -> color_eyre::Result<()> {
    session.mark_session_opened();
    let result = session.forward_messages(channel.into_stream()).await;
    #[cfg(not(coverage_nightly))]
    if let Err(error) = &result {
        debug!(peer = %session.remote_addr(), %error, "Stopped forwarding messages.");
    }
    result
}
