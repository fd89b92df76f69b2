use std::net::SocketAddr;

use tokio::task::JoinHandle;

// A listening socket created on behalf of an SSH session, represented by the
// task that accepts its connections. The task is aborted when the listener is
// closed or dropped.
#[derive(Debug)]
pub struct ForwardedListener {
    address: SocketAddr,
    handle: JoinHandle<()>,
}

impl ForwardedListener {
    pub fn new(address: SocketAddr, handle: JoinHandle<()>) -> Self {
        ForwardedListener { address, handle }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    // Stop accepting connections. Calling this more than once is harmless.
    pub fn close(&self) {
        self.handle.abort();
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for ForwardedListener {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
