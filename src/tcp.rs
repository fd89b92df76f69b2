use std::{net::SocketAddr, sync::Arc, time::Duration};

use bon::Builder;
use color_eyre::eyre::Context;
use metrics::counter;
use tokio::{
    net::{TcpListener, TcpStream},
    time::timeout,
};
#[cfg(not(coverage_nightly))]
use tracing::{error, info, warn};

use crate::{
    connection_handler::ConnectionHandler,
    listener::ForwardedListener,
    relay::{RelayOptions, copy_both},
    session::{SessionConnection, SshSession},
    telemetry::{TELEMETRY_COUNTER_TCP_CONNECTIONS_TOTAL, TELEMETRY_KEY_PORT},
};

// Service that creates TCP listeners for a session's remote forwardings and
// relays their connections through the session.
#[derive(Builder)]
pub struct TcpForwarder<C, H> {
    // Session owning the listeners.
    session: Arc<SshSession<C>>,
    // Handler to open a tunneling channel for each incoming connection.
    handler: Arc<H>,
    // Settings for the relays.
    relay_options: RelayOptions,
    // Optional duration to time out TCP connections.
    tcp_connection_timeout: Option<Duration>,
    // Whether to skip notifying the SSH client of new connections.
    #[builder(default)]
    disable_tcp_logs: bool,
}

impl<C: SessionConnection, H: ConnectionHandler> TcpForwarder<C, H> {
    // Bind a TCP listener and register it in the session under the given key.
    // Returns the bound address, which tells the actual port when binding to port 0.
    pub async fn listen(
        self: Arc<Self>,
        key: impl Into<String>,
        address: SocketAddr,
    ) -> color_eyre::Result<SocketAddr> {
        let setup = self.session.begin_setup().await?;
        let listener = TcpListener::bind(address)
            .await
            .with_context(|| "Error binding forwarded TCP port")?;
        let local_addr = listener
            .local_addr()
            .with_context(|| "Missing local address when binding port")?;
        let port = local_addr.port();
        let token = self.session.close_token();
        let clone = Arc::clone(&self);
        // Start task that will listen to incoming connections.
        let join_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    result = listener.accept() => match result {
                        Ok((stream, address)) => {
                            let forwarder = Arc::clone(&clone);
                            tokio::spawn(async move {
                                forwarder.forward(stream, address, port).await;
                            });
                        }
                        Err(_error) => {
                            #[cfg(not(coverage_nightly))]
                            error!(%port, error = %_error, "Error listening on TCP port.");
                        }
                    }
                }
            }
        });
        setup.add_listener(key, ForwardedListener::new(local_addr, join_handle))?;
        #[cfg(not(coverage_nightly))]
        info!(peer = %self.session.remote_addr(), %local_addr, "Listening on forwarded TCP port.");
        Ok(local_addr)
    }

    async fn forward(&self, stream: TcpStream, address: SocketAddr, port: u16) {
        if let Err(_error) = stream.set_nodelay(true) {
            #[cfg(not(coverage_nightly))]
            warn!(%address, error = %_error, "Error setting nodelay.");
        }
        let ip = address.ip().to_canonical();
        let channel = match self.handler.tunneling_channel(ip, address.port()).await {
            Ok(channel) => channel,
            Err(_error) => {
                #[cfg(not(coverage_nightly))]
                warn!(%address, error = %_error, "Unable to open tunneling channel.");
                return;
            }
        };
        counter!(TELEMETRY_COUNTER_TCP_CONNECTIONS_TOTAL, TELEMETRY_KEY_PORT => port.to_string())
            .increment(1);
        // Log new connection to SSH client, without holding up the relay
        if !self.disable_tcp_logs {
            let session = Arc::clone(&self.session);
            let message = format!(
                "New connection from {}:{} to TCP port {}\r\n",
                ip,
                address.port(),
                port
            );
            tokio::spawn(async move {
                session.send_message(message, false).await;
            });
        }
        match self.tcp_connection_timeout {
            Some(duration) => {
                let _ = timeout(duration, copy_both(stream, channel, self.relay_options)).await;
            }
            None => copy_both(stream, channel, self.relay_options).await,
        }
    }
}
