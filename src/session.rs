use std::{
    future::Future,
    net::SocketAddr,
    num::NonZero,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use ahash::RandomState;
use bon::Builder;
use dashmap::DashMap;
use metrics::gauge;
#[cfg(test)]
use mockall::automock;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::{
        Mutex as AsyncMutex, MutexGuard,
        mpsc::{self, error::TrySendError},
    },
    time::sleep,
};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
#[cfg(not(coverage_nightly))]
use tracing::{debug, info};

use crate::{
    error::ServerError, listener::ForwardedListener,
    telemetry::TELEMETRY_GAUGE_SSH_SESSIONS_CURRENT,
};

// How many times a non-blocking message is retried while the channel is full.
const NON_BLOCKING_SEND_ATTEMPTS: usize = 5;
const NON_BLOCKING_SEND_INTERVAL: Duration = Duration::from_millis(100);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(0);

// The SSH connection behind a session.
pub trait SessionConnection: Send + Sync + 'static {
    fn remote_addr(&self) -> SocketAddr;

    fn user(&self) -> &str;

    // Close the underlying connection. May fail if it's already closed.
    // The returned future must not borrow the connection, so that it can run on its own task.
    fn close(&self) -> impl Future<Output = color_eyre::Result<()>> + Send + 'static;
}

// Process-wide tracking of sessions, keyed by their remote address.
#[cfg_attr(test, automock)]
pub trait SessionTracker {
    // Stop tracking the session with this ID, if it's still the one registered for the address.
    fn remove(&self, peer: &SocketAddr, session_id: u64);
}

// Version of the PROXY protocol header to send upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProxyProtocol {
    #[default]
    Disabled,
    V1,
    V2,
}

// Per-session options read by the routing and relay logic.
// They are fixed when the session is created.
#[derive(Debug, Clone, Default, Builder)]
pub struct SessionModes {
    #[builder(default)]
    pub proxy_protocol: ProxyProtocol,
    #[builder(into)]
    pub host_header: Option<String>,
    #[builder(default)]
    pub strip_path: bool,
    #[builder(default)]
    pub sni_proxy: bool,
    #[builder(default)]
    pub tcp_alias: bool,
    #[builder(default)]
    pub local_forward: bool,
    #[builder(default)]
    pub cleanup_handler: bool,
}

// State for a single SSH connection: its forwarded listeners, the console
// messages queued for the client, and its lifecycle signals.
pub struct SshSession<C> {
    // Unique for the lifetime of the process.
    id: u64,
    connection: C,
    // Forwarded listeners owned by this session, by forwarding key.
    listeners: DashMap<String, ForwardedListener, RandomState>,
    messages_tx: mpsc::Sender<String>,
    // Taken by whichever task forwards the messages to the client.
    messages_rx: Mutex<Option<mpsc::Receiver<String>>>,
    // Fired once, when the session is cleaned up.
    close_token: CancellationToken,
    closed: AtomicBool,
    exec_token: CancellationToken,
    session_token: CancellationToken,
    // Serializes listener setup against teardown.
    setup_lock: AsyncMutex<()>,
    modes: SessionModes,
}

// Held while setting up listeners for a session. Teardown waits for it to be
// released before closing the session's listeners.
pub struct SetupGuard<'a, C> {
    session: &'a SshSession<C>,
    _guard: MutexGuard<'a, ()>,
}

impl<C> SetupGuard<'_, C> {
    // Register a listener, replacing (and closing) any listener with the same key.
    // If the session has been closed in the meantime, the listener is closed instead.
    pub fn add_listener(
        &self,
        key: impl Into<String>,
        listener: ForwardedListener,
    ) -> Result<(), ServerError> {
        let session = self.session;
        if session.is_closed() {
            listener.close();
            return Err(ServerError::SessionClosed);
        }
        let key = key.into();
        if let Some(previous) = session.listeners.insert(key.clone(), listener) {
            previous.close();
        }
        // Teardown may have drained the listeners between the check and the insert.
        if session.is_closed() {
            if let Some((_, listener)) = session.listeners.remove(&key) {
                listener.close();
            }
            return Err(ServerError::SessionClosed);
        }
        Ok(())
    }
}

impl<C> SshSession<C> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close_listeners(&self) {
        self.listeners.retain(|_, listener| {
            listener.close();
            false
        });
    }
}

impl<C: SessionConnection> SshSession<C> {
    pub fn new(connection: C, modes: SessionModes, message_buffer_size: NonZero<usize>) -> Self {
        let (messages_tx, messages_rx) = mpsc::channel(message_buffer_size.get());
        SshSession {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            connection,
            listeners: DashMap::default(),
            messages_tx,
            messages_rx: Mutex::new(Some(messages_rx)),
            close_token: CancellationToken::new(),
            closed: AtomicBool::new(false),
            exec_token: CancellationToken::new(),
            session_token: CancellationToken::new(),
            setup_lock: AsyncMutex::new(()),
            modes,
        }
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.connection.remote_addr()
    }

    pub fn user(&self) -> &str {
        self.connection.user()
    }

    pub fn modes(&self) -> &SessionModes {
        &self.modes
    }

    // Queue a console message for the client.
    //
    // When blocking, wait until there is room for the message (or until the
    // session closes). Otherwise, try a few times while the queue is full and
    // then give up silently: these messages are informational only.
    pub async fn send_message(&self, message: impl Into<String>, block: bool) {
        let mut message = message.into();
        if block {
            tokio::select! {
                biased;
                _ = self.close_token.cancelled() => {}
                _ = self.messages_tx.send(message) => {}
            }
            return;
        }
        for _ in 0..NON_BLOCKING_SEND_ATTEMPTS {
            if self.close_token.is_cancelled() {
                return;
            }
            match self.messages_tx.try_send(message) {
                Ok(()) | Err(TrySendError::Closed(_)) => return,
                Err(TrySendError::Full(returned)) => message = returned,
            }
            tokio::select! {
                _ = sleep(NON_BLOCKING_SEND_INTERVAL) => {}
                _ = self.close_token.cancelled() => return,
            }
        }
    }

    // Take the receiving end of the console messages. Only the first call gets it.
    pub fn take_messages(&self) -> Option<mpsc::Receiver<String>> {
        self.messages_rx.lock().unwrap().take()
    }

    // Write console messages to the client until the session closes, then
    // flush whatever is still queued.
    pub async fn forward_messages<W>(&self, mut writer: W) -> color_eyre::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut rx = self
            .take_messages()
            .ok_or(ServerError::MessagesAlreadyTaken)?;
        loop {
            tokio::select! {
                _ = self.close_token.cancelled() => {
                    while let Ok(message) = rx.try_recv() {
                        if writer.write_all(message.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    let _ = writer.flush().await;
                    let _ = writer.shutdown().await;
                    break;
                }
                message = rx.recv() => {
                    let Some(message) = message else { break };
                    writer.write_all(message.as_bytes()).await?;
                    writer.flush().await?;
                }
            }
        }
        Ok(())
    }

    // Start setting up listeners. Fails if the session is already closed.
    pub async fn begin_setup(&self) -> Result<SetupGuard<'_, C>, ServerError> {
        let guard = self.setup_lock.lock().await;
        if self.is_closed() {
            return Err(ServerError::SessionClosed);
        }
        Ok(SetupGuard {
            session: self,
            _guard: guard,
        })
    }

    pub async fn add_listener(
        &self,
        key: impl Into<String>,
        listener: ForwardedListener,
    ) -> Result<(), ServerError> {
        self.begin_setup().await?.add_listener(key, listener)
    }

    // Close and forget a single listener. Returns whether it existed.
    pub fn remove_listener(&self, key: &str) -> bool {
        match self.listeners.remove(key) {
            Some((_, listener)) => {
                listener.close();
                true
            }
            None => false,
        }
    }

    pub fn listener_addr(&self, key: &str) -> Option<SocketAddr> {
        self.listeners
            .get(key)
            .map(|listener| listener.value().local_addr())
    }

    pub fn listener_keys(&self) -> Vec<String> {
        self.listeners
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    // Resolves once the session has been cleaned up.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.close_token.cancelled()
    }

    // A token cancelled along with the session. Cancelling it doesn't affect the session.
    pub fn close_token(&self) -> CancellationToken {
        self.close_token.child_token()
    }

    pub fn mark_exec_opened(&self) {
        self.exec_token.cancel();
    }

    pub fn is_exec_opened(&self) -> bool {
        self.exec_token.is_cancelled()
    }

    pub fn exec_opened(&self) -> WaitForCancellationFuture<'_> {
        self.exec_token.cancelled()
    }

    pub fn mark_session_opened(&self) {
        self.session_token.cancel();
    }

    pub fn is_session_opened(&self) -> bool {
        self.session_token.is_cancelled()
    }

    pub fn session_opened(&self) -> WaitForCancellationFuture<'_> {
        self.session_token.cancelled()
    }

    // Release every resource held by this session. Only the first call has any effect.
    //
    // Dropping the returned future partway through still leaves the session
    // closed: the tracker entry and the listeners are released before the first
    // await, the connection is closed on its own task, and any setup still in
    // progress closes its listeners itself.
    pub async fn clean_up<T>(&self, tracker: &T)
    where
        T: SessionTracker + Sync + ?Sized,
    {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close_token.cancel();
        let peer = self.connection.remote_addr();
        let close = tokio::spawn(self.connection.close());
        tracker.remove(&peer, self.id);
        self.close_listeners();
        match close.await {
            Ok(Ok(())) => (),
            Ok(Err(_error)) => {
                #[cfg(not(coverage_nightly))]
                debug!(%peer, error = %_error, "Error closing SSH connection.");
            }
            Err(_error) => {
                #[cfg(not(coverage_nightly))]
                debug!(%peer, error = %_error, "SSH connection close task failed.");
            }
        }
        {
            // Wait for any ongoing setup before closing the listeners.
            let _guard = self.setup_lock.lock().await;
            self.close_listeners();
        }
        #[cfg(not(coverage_nightly))]
        info!(%peer, user = %self.connection.user(), "Closed SSH connection.");
    }
}

// Sessions currently connected to this server.
pub struct SessionRegistry<C> {
    sessions: DashMap<SocketAddr, Arc<SshSession<C>>, RandomState>,
}

impl<C> Default for SessionRegistry<C> {
    fn default() -> Self {
        SessionRegistry {
            sessions: DashMap::default(),
        }
    }
}

impl<C: SessionConnection> SessionRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    // Track a session by its remote address, returning any session it replaced.
    pub fn insert(&self, session: Arc<SshSession<C>>) -> Option<Arc<SshSession<C>>> {
        let previous = self.sessions.insert(session.remote_addr(), session);
        if previous.is_none() {
            gauge!(TELEMETRY_GAUGE_SSH_SESSIONS_CURRENT).increment(1);
        }
        previous
    }

    pub fn get(&self, peer: &SocketAddr) -> Option<Arc<SshSession<C>>> {
        self.sessions
            .get(peer)
            .map(|session| Arc::clone(session.value()))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    // Clean up every tracked session, i.e. when shutting down.
    pub async fn clean_up_all(&self) {
        let sessions: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for session in sessions {
            session.clean_up(self).await;
        }
    }
}

impl<C> SessionTracker for SessionRegistry<C> {
    fn remove(&self, peer: &SocketAddr, session_id: u64) {
        if self
            .sessions
            .remove_if(peer, |_, session| session.id() == session_id)
            .is_some()
        {
            gauge!(TELEMETRY_GAUGE_SSH_SESSIONS_CURRENT).decrement(1);
        }
    }
}

// Connection stub for tests, counting how many times it was closed.
#[cfg(test)]
pub(crate) struct TestConnection {
    pub(crate) peer: SocketAddr,
    pub(crate) user: String,
    pub(crate) fail_close: bool,
    pub(crate) closes: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl TestConnection {
    pub(crate) fn new(peer: &str) -> Self {
        TestConnection {
            peer: peer.parse().unwrap(),
            user: "user".into(),
            fail_close: false,
            closes: Default::default(),
        }
    }
}

#[cfg(test)]
impl SessionConnection for TestConnection {
    fn remote_addr(&self) -> SocketAddr {
        self.peer
    }

    fn user(&self) -> &str {
        &self.user
    }

    fn close(&self) -> impl Future<Output = color_eyre::Result<()>> + Send + 'static {
        let previous = self.closes.fetch_add(1, Ordering::SeqCst);
        let fail = self.fail_close || previous > 0;
        async move {
            if fail {
                Err(ServerError::ConnectionCloseFailed.into())
            } else {
                Ok(())
            }
        }
    }
}
