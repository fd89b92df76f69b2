use std::time::Duration;

use bon::Builder;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, copy_buf, split};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::{config::ApplicationConfig, idle::IdleTimeoutStream};

// Settings shared by every relay.
#[derive(Debug, Clone, Copy, Builder)]
pub struct RelayOptions {
    // Rolling idle timeout applied to the downstream connection, if enabled.
    pub idle_timeout: Option<Duration>,
    // Buffer size for each direction.
    #[builder(default = 32_768)]
    pub buffer_size: usize,
    // Whether to log the errors that end a relay.
    #[builder(default)]
    pub debug: bool,
}

impl From<&ApplicationConfig> for RelayOptions {
    fn from(config: &ApplicationConfig) -> Self {
        RelayOptions {
            idle_timeout: config
                .idle_connection
                .then_some(config.idle_connection_timeout),
            buffer_size: config.buffer_size,
            debug: config.debug,
        }
    }
}

// Copy data between a proxied connection and the client-side channel until
// either direction ends, then shut down both.
//
// The upstream-to-downstream direction runs on its own task, and this function
// only waits for the downstream-to-upstream direction; the other task may still
// be shutting down its writer when this returns.
pub async fn copy_both<D, U>(downstream: D, upstream: U, options: RelayOptions)
where
    D: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    U: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    match options.idle_timeout {
        Some(idle_timeout) => {
            relay(
                IdleTimeoutStream::new(downstream, idle_timeout),
                upstream,
                options,
            )
            .await
        }
        None => relay(downstream, upstream, options).await,
    }
}

async fn relay<D, U>(downstream: D, upstream: U, options: RelayOptions)
where
    D: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    U: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (downstream_reader, downstream_writer) = split(downstream);
    let (upstream_reader, upstream_writer) = split(upstream);
    let token = CancellationToken::new();
    // Stop the spawned direction if this future gets dropped early.
    let _guard = token.clone().drop_guard();
    tokio::spawn(copy_direction(
        upstream_reader,
        downstream_writer,
        token.clone(),
        options,
        Direction::ToDownstream,
    ));
    copy_direction(
        downstream_reader,
        upstream_writer,
        token,
        options,
        Direction::ToUpstream,
    )
    .await;
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    ToUpstream,
    ToDownstream,
}

async fn copy_direction<R, W>(
    reader: R,
    mut writer: W,
    token: CancellationToken,
    options: RelayOptions,
    direction: Direction,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::with_capacity(options.buffer_size, reader);
    tokio::select! {
        result = copy_buf(&mut reader, &mut writer) => match result {
            Ok(bytes) => trace!(?direction, bytes, "Relay direction finished."),
            Err(error) if options.debug => warn!(?direction, %error, "Error copying data."),
            Err(_) => {}
        },
        _ = token.cancelled() => {}
    }
    // Either way, the whole relay is over.
    token.cancel();
    let _ = writer.shutdown().await;
}
