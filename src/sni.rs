use std::{net::SocketAddr, sync::Arc, time::Duration};

use ahash::RandomState;
use bon::Builder;
use dashmap::DashMap;
use metrics::counter;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    time::timeout,
};
#[cfg(not(coverage_nightly))]
use tracing::{debug, warn};

use crate::{
    connection_handler::ConnectionHandler,
    error::ServerError,
    relay::{RelayOptions, copy_both},
    tee::ReplayStream,
    telemetry::{TELEMETRY_COUNTER_SNI_CONNECTIONS_TOTAL, TELEMETRY_KEY_HOSTNAME},
    tls::{TlsHello, peek_tls_hello},
};

// What happened to a connection handed to the SNI proxy.
pub enum SniOutcome<S> {
    // The connection was relayed, untouched, to the handler for this server name.
    Relayed { server_name: String },
    // No handler wants this connection. The stream replays the ClientHello, so
    // the caller can run a regular TLS handshake on it.
    Unrouted {
        hello: TlsHello,
        stream: ReplayStream<S>,
    },
}

// Routes raw TLS connections to tunnels by the server name in their ClientHello,
// without terminating TLS.
#[derive(Builder)]
pub struct SniProxy<H> {
    #[builder(skip = DashMap::default())]
    routes: DashMap<String, Arc<H>, RandomState>,
    // Settings for the relays.
    relay_options: RelayOptions,
    // How long to wait for the ClientHello.
    #[builder(default = Duration::from_secs(1))]
    peek_timeout: Duration,
    // Optional duration to time out proxied connections.
    tcp_connection_timeout: Option<Duration>,
}

impl<H: ConnectionHandler> SniProxy<H> {
    // Route connections for this server name to the handler. Returns the handler it replaced.
    pub fn insert(&self, server_name: impl Into<String>, handler: Arc<H>) -> Option<Arc<H>> {
        self.routes
            .insert(server_name.into().to_ascii_lowercase(), handler)
    }

    pub fn remove(&self, server_name: &str) -> Option<Arc<H>> {
        self.routes
            .remove(&server_name.to_ascii_lowercase())
            .map(|(_, handler)| handler)
    }

    pub fn contains(&self, server_name: &str) -> bool {
        self.routes.contains_key(&server_name.to_ascii_lowercase())
    }

    pub async fn handle_connection<S>(
        &self,
        mut stream: S,
        address: SocketAddr,
    ) -> color_eyre::Result<SniOutcome<S>>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (hello, captured) = timeout(self.peek_timeout, peek_tls_hello(&mut stream))
            .await
            .map_err(|_| ServerError::ClientHelloTimeout)??;
        let stream = ReplayStream::new(captured, stream);
        let handler = hello.server_name.as_ref().and_then(|server_name| {
            self.routes
                .get(&server_name.to_ascii_lowercase())
                .map(|handler| (server_name.clone(), Arc::clone(handler.value())))
        });
        let Some((server_name, handler)) = handler else {
            #[cfg(not(coverage_nightly))]
            debug!(%address, server_name = ?hello.server_name, "No SNI route for connection.");
            return Ok(SniOutcome::Unrouted { hello, stream });
        };
        let ip = address.ip().to_canonical();
        let channel = match handler.tunneling_channel(ip, address.port()).await {
            Ok(channel) => channel,
            Err(error) => {
                #[cfg(not(coverage_nightly))]
                warn!(%address, %server_name, %error, "Unable to open tunneling channel.");
                return Err(error);
            }
        };
        counter!(TELEMETRY_COUNTER_SNI_CONNECTIONS_TOTAL, TELEMETRY_KEY_HOSTNAME => server_name.clone())
            .increment(1);
        match self.tcp_connection_timeout {
            Some(duration) => {
                let _ = timeout(duration, copy_both(stream, channel, self.relay_options)).await;
            }
            None => copy_both(stream, channel, self.relay_options).await,
        }
        Ok(SniOutcome::Relayed { server_name })
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod sni_proxy_tests {
    use std::{sync::Arc, time::Duration};

    use rustls::pki_types::ServerName;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt, duplex},
        time::timeout,
    };
    use tokio_rustls::{TlsAcceptor, TlsConnector};

    use crate::{
        connection_handler::DuplexHandler,
        error::ServerError,
        relay::RelayOptions,
        tls::test_tls::{client_hello, tls_configs},
    };

    use super::{SniOutcome, SniProxy};

    fn proxy() -> SniProxy<DuplexHandler> {
        SniProxy::builder()
            .relay_options(RelayOptions::builder().build())
            .peek_timeout(Duration::from_millis(200))
            .build()
    }

    #[test_log::test(tokio::test)]
    async fn relays_raw_tls_to_matching_route() {
        let proxy = Arc::new(proxy());
        let (handler, mut channels) = DuplexHandler::new();
        assert!(proxy.insert("Example.com", Arc::new(handler)).is_none());
        assert!(proxy.contains("example.com"));

        let hello = client_hello("example.com", &[b"h2"]);
        let (mut client, server) = duplex(64 * 1024);
        client.write_all(&hello).await.unwrap();
        let task = {
            let proxy = Arc::clone(&proxy);
            tokio::spawn(async move {
                proxy
                    .handle_connection(server, "127.0.0.1:40000".parse().unwrap())
                    .await
            })
        };
        let (ip, port, mut channel) = timeout(Duration::from_secs(1), channels.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ip.to_string(), "127.0.0.1");
        assert_eq!(port, 40000);
        // The tunnel receives the exact bytes the client sent, hello included.
        let mut received = vec![0u8; hello.len()];
        channel.read_exact(&mut received).await.unwrap();
        assert_eq!(received, hello);
        client.write_all(b"more").await.unwrap();
        let mut buf = [0u8; 4];
        channel.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"more");
        channel.write_all(b"back").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"back");

        drop(client);
        let outcome = timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(
            outcome,
            SniOutcome::Relayed { server_name } if server_name == "example.com"
        ));
    }

    #[test_log::test(tokio::test)]
    async fn returns_replayable_stream_when_unrouted() {
        let proxy = proxy();
        let (server_config, client_config) = tls_configs("unrouted.example");
        let (client_stream, server_stream) = duplex(64 * 1024);
        let client = tokio::spawn(async move {
            let mut tls = TlsConnector::from(client_config)
                .connect(
                    ServerName::try_from("unrouted.example").unwrap(),
                    client_stream,
                )
                .await
                .unwrap();
            tls.write_all(b"hello").await.unwrap();
            tls.shutdown().await.unwrap();
        });
        let outcome = proxy
            .handle_connection(server_stream, "127.0.0.1:40000".parse().unwrap())
            .await
            .unwrap();
        let SniOutcome::Unrouted { hello, stream } = outcome else {
            panic!("connection shouldn't be routed");
        };
        assert_eq!(hello.server_name.as_deref(), Some("unrouted.example"));
        let mut tls = TlsAcceptor::from(server_config).accept(stream).await.unwrap();
        let mut received = String::new();
        tls.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, "hello");
        timeout(Duration::from_secs(1), client)
            .await
            .unwrap()
            .unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn stops_routing_removed_server_names() {
        let proxy = proxy();
        let (handler, _channels) = DuplexHandler::new();
        proxy.insert("example.com", Arc::new(handler));
        assert!(proxy.remove("EXAMPLE.com").is_some());
        assert!(!proxy.contains("example.com"));
        let (mut client, server) = duplex(64 * 1024);
        client
            .write_all(&client_hello("example.com", &[]))
            .await
            .unwrap();
        let outcome = proxy
            .handle_connection(server, "127.0.0.1:40000".parse().unwrap())
            .await
            .unwrap();
        assert!(matches!(outcome, SniOutcome::Unrouted { .. }));
    }

    #[test_log::test(tokio::test)]
    async fn times_out_without_client_hello() {
        let proxy = proxy();
        let (_client, server) = duplex(64 * 1024);
        let error = match proxy
            .handle_connection(server, "127.0.0.1:40000".parse().unwrap())
            .await
        {
            Ok(_) => panic!("should time out"),
            Err(error) => error,
        };
        assert!(matches!(
            error.downcast_ref::<ServerError>(),
            Some(ServerError::ClientHelloTimeout)
        ));
    }

    #[test_log::test(tokio::test)]
    async fn fails_when_channel_cannot_be_opened() {
        let proxy = proxy();
        let (mut handler, _channels) = DuplexHandler::new();
        handler.fail = true;
        proxy.insert("example.com", Arc::new(handler));
        let (mut client, server) = duplex(64 * 1024);
        client
            .write_all(&client_hello("example.com", &[]))
            .await
            .unwrap();
        assert!(
            proxy
                .handle_connection(server, "127.0.0.1:40000".parse().unwrap())
                .await
                .is_err()
        );
    }
}
