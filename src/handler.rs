//! Per-connection command loop.
//!
//! Each accepted connection gets its own [`ConnectionHandler`] running on its
//! own task. The handler reads whatever bytes are available into a fixed-size
//! command buffer, writes exactly those bytes back, and repeats until the
//! peer goes away, an I/O error occurs, or the server shuts down.
//!
//! There is no framing: one read is one command. A payload larger than the
//! buffer is seen as several commands, each echoed on its own.

use crate::config::Config;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// Settings every handler is started with.
#[derive(Debug, Clone)]
pub struct HandlerOptions {
    /// Command buffer capacity in bytes.
    pub buffer_size: usize,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
}

impl From<&Config> for HandlerOptions {
    fn from(config: &Config) -> Self {
        Self {
            buffer_size: config.buffer_size,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
        }
    }
}

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Clean end-of-stream from the client.
    PeerClosed,
    ReadFailed(io::ErrorKind),
    WriteFailed(io::ErrorKind),
    /// The server is stopping.
    Shutdown,
}

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    /// Waiting for the next command.
    Reading,
    /// Echoing the first `len` bytes of the command buffer.
    Responding { len: usize },
    /// Terminal; the stream is shut down and dropped.
    Closing(CloseReason),
}

/// Services exactly one client connection for its whole lifetime.
pub struct ConnectionHandler<S> {
    stream: S,
    peer: SocketAddr,
    buffer: Vec<u8>,
    options: HandlerOptions,
    shutdown: watch::Receiver<bool>,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        peer: SocketAddr,
        options: HandlerOptions,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            stream,
            peer,
            buffer: vec![0u8; options.buffer_size],
            options,
            shutdown,
        }
    }

    /// Run the read/respond loop until the connection closes.
    ///
    /// Consumes the handler, so the stream is closed exactly once.
    pub async fn run(mut self) -> CloseReason {
        let mut state = ConnState::Reading;

        let reason = loop {
            state = match state {
                ConnState::Reading => self.read_command().await,
                ConnState::Responding { len } => self.respond(len).await,
                ConnState::Closing(reason) => break reason,
            };
        };

        self.close(reason).await;
        reason
    }

    async fn read_command(&mut self) -> ConnState {
        let result = tokio::select! {
            result = with_deadline(self.options.read_timeout, self.stream.read(&mut self.buffer)) => result,
            _ = stopped(&mut self.shutdown) => return ConnState::Closing(CloseReason::Shutdown),
        };

        match result {
            Ok(0) => ConnState::Closing(CloseReason::PeerClosed),
            Ok(n) => {
                trace!(
                    peer = %self.peer,
                    bytes = n,
                    command = %String::from_utf8_lossy(&self.buffer[..n]),
                    "Command received"
                );
                ConnState::Responding { len: n }
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                ConnState::Closing(CloseReason::PeerClosed)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => ConnState::Reading,
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "Read failed");
                ConnState::Closing(CloseReason::ReadFailed(e.kind()))
            }
        }
    }

    async fn respond(&mut self, len: usize) -> ConnState {
        let command = &self.buffer[..len];

        let result = tokio::select! {
            result = with_deadline(self.options.write_timeout, self.stream.write_all(command)) => result,
            _ = stopped(&mut self.shutdown) => return ConnState::Closing(CloseReason::Shutdown),
        };

        match result {
            Ok(()) => ConnState::Reading,
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "Write failed");
                ConnState::Closing(CloseReason::WriteFailed(e.kind()))
            }
        }
    }

    async fn close(mut self, reason: CloseReason) {
        if let Err(e) = with_deadline(self.options.write_timeout, self.stream.shutdown()).await {
            debug!(peer = %self.peer, error = %e, "Shutdown after close failed");
        }

        info!(peer = %self.peer, reason = ?reason, "Client disconnected");
    }
}

/// Resolves once shutdown is signalled. Never resolves if the sender is gone
/// without having signalled.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let closed = shutdown.wait_for(|stop| *stop).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

async fn with_deadline<F, T>(deadline: Option<Duration>, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match deadline {
        Some(limit) => tokio::time::timeout(limit, fut).await.unwrap_or_else(|_| {
            Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no progress within {limit:?}"),
            ))
        }),
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    fn options(buffer_size: usize) -> HandlerOptions {
        HandlerOptions {
            buffer_size,
            read_timeout: None,
            write_timeout: None,
        }
    }

    async fn run_with<S>(stream: S, opts: HandlerOptions) -> CloseReason
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (_tx, rx) = watch::channel(false);
        ConnectionHandler::new(stream, peer(), opts, rx).run().await
    }

    #[tokio::test]
    async fn test_echoes_each_command() {
        let mock = Builder::new()
            .read(b"PING")
            .write(b"PING")
            .read(b"QUIT")
            .write(b"QUIT")
            .build();

        assert_eq!(run_with(mock, options(512)).await, CloseReason::PeerClosed);
    }

    #[tokio::test]
    async fn test_binary_payload_unchanged() {
        let payload = [0u8, 255, 13, 10, 0, 7];
        let mock = Builder::new().read(&payload).write(&payload).build();

        assert_eq!(run_with(mock, options(512)).await, CloseReason::PeerClosed);
    }

    #[tokio::test]
    async fn test_command_at_exact_capacity_echoed_whole() {
        let mock = Builder::new().read(b"ABCD").write(b"ABCD").build();

        assert_eq!(run_with(mock, options(4)).await, CloseReason::PeerClosed);
    }

    #[tokio::test]
    async fn test_oversized_command_split_at_capacity() {
        // The tail of the payload is picked up by the next read.
        let mock = Builder::new()
            .read(b"ABCDEFGHIJ")
            .write(b"ABCD")
            .write(b"EFGH")
            .write(b"IJ")
            .read(b"ok")
            .write(b"ok")
            .build();

        assert_eq!(run_with(mock, options(4)).await, CloseReason::PeerClosed);
    }

    #[tokio::test]
    async fn test_immediate_eof_writes_nothing() {
        let mock = Builder::new().build();

        assert_eq!(run_with(mock, options(512)).await, CloseReason::PeerClosed);
    }

    #[tokio::test]
    async fn test_read_error_closes() {
        let mock = Builder::new()
            .read(b"PING")
            .write(b"PING")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();

        assert_eq!(
            run_with(mock, options(512)).await,
            CloseReason::ReadFailed(io::ErrorKind::ConnectionReset)
        );
    }

    #[tokio::test]
    async fn test_write_error_closes_without_retry() {
        let mock = Builder::new()
            .read(b"PING")
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
            .build();

        assert_eq!(
            run_with(mock, options(512)).await,
            CloseReason::WriteFailed(io::ErrorKind::BrokenPipe)
        );
    }

    #[tokio::test]
    async fn test_interrupted_read_is_retried() {
        let mock = Builder::new()
            .read_error(io::Error::new(io::ErrorKind::Interrupted, "signal"))
            .read(b"hi")
            .write(b"hi")
            .build();

        assert_eq!(run_with(mock, options(512)).await, CloseReason::PeerClosed);
    }

    #[tokio::test]
    async fn test_unexpected_eof_is_peer_close() {
        let mock = Builder::new()
            .read_error(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"))
            .build();

        assert_eq!(run_with(mock, options(512)).await, CloseReason::PeerClosed);
    }

    #[tokio::test]
    async fn test_write_timeout_closes_when_client_stops_reading() {
        // Room for one echo; the second one cannot be delivered.
        let (server, mut client) = tokio::io::duplex(8);
        let opts = HandlerOptions {
            write_timeout: Some(Duration::from_millis(50)),
            ..options(8)
        };
        let (_tx, rx) = watch::channel(false);

        let task = tokio::spawn(ConnectionHandler::new(server, peer(), opts, rx).run());
        client.write_all(&[7u8; 16]).await.unwrap();

        assert_eq!(
            task.await.unwrap(),
            CloseReason::WriteFailed(io::ErrorKind::TimedOut)
        );
    }

    #[tokio::test]
    async fn test_read_timeout_closes_idle_connection() {
        let (server, _client) = tokio::io::duplex(64);
        let opts = HandlerOptions {
            read_timeout: Some(Duration::from_millis(20)),
            ..options(512)
        };

        assert_eq!(
            run_with(server, opts).await,
            CloseReason::ReadFailed(io::ErrorKind::TimedOut)
        );
    }

    #[tokio::test]
    async fn test_shutdown_signal_stops_handler() {
        let (server, _client) = tokio::io::duplex(64);
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(ConnectionHandler::new(server, peer(), options(512), rx).run());
        tx.send(true).unwrap();

        assert_eq!(task.await.unwrap(), CloseReason::Shutdown);
    }

    #[tokio::test]
    async fn test_client_sees_eof_after_close() {
        let (server, mut client) = tokio::io::duplex(64);
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(ConnectionHandler::new(server, peer(), options(512), rx).run());

        client.write_all(b"PING").await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"PING");

        tx.send(true).unwrap();
        assert_eq!(task.await.unwrap(), CloseReason::Shutdown);

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
