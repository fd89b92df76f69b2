use std::{
    future::Future,
    io,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    time::{Instant, Sleep, sleep_until},
};

fn idle_timeout_error() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "connection idle timeout")
}

// Stream with a rolling inactivity deadline.
//
// Each read or write first moves the deadline to now + timeout, then runs the
// underlying I/O. Once the deadline passes without any read or write, the stream
// is expired and every later operation fails with `TimedOut`.
//
// Must be created from within a Tokio runtime.
#[derive(Debug)]
pub struct IdleTimeoutStream<S> {
    inner: S,
    timeout: Duration,
    last_activity: Instant,
    // Reads and writes may be polled from different tasks, so each direction
    // waits on its own timer.
    read_deadline: Pin<Box<Sleep>>,
    write_deadline: Pin<Box<Sleep>>,
    reading: bool,
    writing: bool,
    expired: bool,
}

impl<S> IdleTimeoutStream<S> {
    pub fn new(inner: S, timeout: Duration) -> Self {
        let now = Instant::now();
        IdleTimeoutStream {
            inner,
            timeout,
            last_activity: now,
            read_deadline: Box::pin(sleep_until(now + timeout)),
            write_deadline: Box::pin(sleep_until(now + timeout)),
            reading: false,
            writing: false,
            expired: false,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_expired(&self) -> bool {
        self.expired || self.last_activity.elapsed() >= self.timeout
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn touch(&mut self) {
        let now = Instant::now();
        self.last_activity = now;
        self.read_deadline.as_mut().reset(now + self.timeout);
        self.write_deadline.as_mut().reset(now + self.timeout);
    }

    fn check_expired(&mut self) -> io::Result<()> {
        if self.is_expired() {
            self.expired = true;
            return Err(idle_timeout_error());
        }
        Ok(())
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for IdleTimeoutStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.expired {
            this.reading = false;
            return Poll::Ready(Err(idle_timeout_error()));
        }
        // A pending operation only expires through its deadline.
        if !this.reading {
            this.check_expired()?;
            this.touch();
            this.reading = true;
        }
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.reading = false;
                if result.is_ok() {
                    this.touch();
                }
                Poll::Ready(result)
            }
            Poll::Pending => match this.read_deadline.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    this.reading = false;
                    this.expired = true;
                    Poll::Ready(Err(idle_timeout_error()))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for IdleTimeoutStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.expired {
            this.writing = false;
            return Poll::Ready(Err(idle_timeout_error()));
        }
        // A pending operation only expires through its deadline.
        if !this.writing {
            this.check_expired()?;
            this.touch();
            this.writing = true;
        }
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(result) => {
                this.writing = false;
                if result.is_ok() {
                    this.touch();
                }
                Poll::Ready(result)
            }
            Poll::Pending => match this.write_deadline.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    this.writing = false;
                    this.expired = true;
                    Poll::Ready(Err(idle_timeout_error()))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Err(error) = this.check_expired() {
            return Poll::Ready(Err(error));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    // Shutting down is always allowed, even after expiring.
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod idle_timeout_stream_tests {
    use std::{future::poll_fn, io, pin::pin, task::Poll, time::Duration};

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt, duplex},
        time::{sleep, timeout},
    };

    use super::IdleTimeoutStream;

    #[tokio::test]
    async fn becomes_unusable_after_idle_window() {
        let (_peer, stream) = duplex(1024);
        let mut stream = IdleTimeoutStream::new(stream, Duration::from_millis(50));
        sleep(Duration::from_millis(60)).await;
        assert!(stream.is_expired());
        let error = stream.write_all(b"late").await.unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::TimedOut);
        let mut buf = [0u8; 4];
        let error = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn pending_read_times_out() {
        let (_peer, stream) = duplex(1024);
        let mut stream = IdleTimeoutStream::new(stream, Duration::from_millis(50));
        let mut buf = [0u8; 4];
        let result = timeout(Duration::from_secs(1), stream.read(&mut buf))
            .await
            .expect("read should time out on its own");
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::TimedOut);
        assert!(stream.is_expired());
        let error = stream.write_all(b"after").await.unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn pending_read_returns_data_ready_after_late_wakeup() {
        let (mut peer, stream) = duplex(1024);
        let mut stream = IdleTimeoutStream::new(stream, Duration::from_millis(50));
        let mut buf = [0u8; 4];
        {
            let mut read = pin!(stream.read(&mut buf));
            assert!(poll_fn(|cx| Poll::Ready(read.as_mut().poll(cx).is_pending())).await);
            peer.write_all(b"late").await.unwrap();
            // Block the runtime past the window, so the read is only polled again afterwards.
            std::thread::sleep(Duration::from_millis(60));
            assert_eq!(read.await.unwrap(), 4);
        }
        assert_eq!(&buf, b"late");
    }

    #[tokio::test]
    async fn stays_usable_with_regular_writes() {
        let (mut peer, stream) = duplex(64 * 1024);
        let mut stream = IdleTimeoutStream::new(stream, Duration::from_millis(50));
        for _ in 0..12 {
            sleep(Duration::from_millis(20)).await;
            stream.write_all(b"tick").await.unwrap();
        }
        assert!(!stream.is_expired());
        let mut buf = [0u8; 48];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..4], b"tick");
    }

    #[tokio::test]
    async fn stays_usable_while_reading_regular_traffic() {
        let (mut peer, stream) = duplex(1024);
        let mut stream = IdleTimeoutStream::new(stream, Duration::from_millis(50));
        let writer = tokio::spawn(async move {
            for _ in 0..12 {
                sleep(Duration::from_millis(20)).await;
                peer.write_all(b"x").await.unwrap();
            }
            peer
        });
        let mut received = 0;
        let mut buf = [0u8; 16];
        while received < 12 {
            received += stream.read(&mut buf).await.unwrap();
        }
        let _peer = writer.await.unwrap();
        assert!(!stream.is_expired());
    }

    #[tokio::test]
    async fn passes_data_through() {
        let (mut peer, stream) = duplex(1024);
        let mut stream = IdleTimeoutStream::new(stream, Duration::from_secs(5));
        peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        stream.write_all(b"pong").await.unwrap();
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }
}
