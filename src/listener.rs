//! TCP listener and accept loop.
//!
//! The listener owns the bound server socket. Every accepted connection is
//! moved into a freshly spawned [`ConnectionHandler`] task and the loop goes
//! straight back to accepting; it never waits on a handler and never touches
//! client data itself.

use crate::config::Config;
use crate::error::{AcceptErrorKind, ServerError};
use crate::handler::{ConnectionHandler, HandlerOptions};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Pending connection queue length passed to `listen(2)`.
const LISTEN_BACKLOG: i32 = 1024;

/// First delay after a transient accept error.
const INITIAL_BACKOFF: Duration = Duration::from_millis(5);

/// Upper bound for the accept retry delay.
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Source of inbound connections for the accept loop.
pub trait Acceptor {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn accept(&self) -> impl Future<Output = io::Result<(Self::Stream, SocketAddr)>> + Send;
}

impl Acceptor for TcpListener {
    type Stream = TcpStream;

    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        async move {
            let (stream, peer) = TcpListener::accept(self).await?;
            if let Err(e) = stream.set_nodelay(true) {
                debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
            }
            Ok((stream, peer))
        }
    }
}

/// Exponential delay between retries of a transiently failing `accept`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; doubles the following one up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Back to the initial delay after a successful accept.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL_BACKOFF, MAX_BACKOFF)
    }
}

/// Bound listening socket plus everything needed to start handlers.
pub struct Listener<A = TcpListener> {
    acceptor: A,
    options: HandlerOptions,
    /// `None` when the number of connections is unbounded.
    connection_limit: Option<Arc<Semaphore>>,
    active: ActiveConnections,
    backoff: Backoff,
}

/// Number of connections that currently have a live handler.
#[derive(Debug, Clone, Default)]
pub struct ActiveConnections(Arc<AtomicUsize>);

impl ActiveConnections {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

/// Held by a handler task for as long as it runs. Dropping it (normal exit,
/// error or unwind) releases the admission slot and the live count.
struct ConnectionGuard {
    active: ActiveConnections,
    peer: SocketAddr,
    _permit: Option<OwnedSemaphorePermit>,
}

impl ConnectionGuard {
    fn new(
        active: &ActiveConnections,
        peer: SocketAddr,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        active.0.fetch_add(1, Ordering::AcqRel);
        Self {
            active: active.clone(),
            peer,
            _permit: permit,
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let remaining = self.active.0.fetch_sub(1, Ordering::AcqRel) - 1;
        debug!(peer = %self.peer, active = remaining, "Connection released");
    }
}

impl Listener {
    /// Resolve `host:port` and bind the listening socket.
    ///
    /// Nothing is left open when this fails.
    pub async fn bind(config: &Config) -> Result<Self, ServerError> {
        let addr = config.server.address();
        let bind_err = |source: io::Error| ServerError::Bind {
            addr: addr.clone(),
            source,
        };

        let socket_addr = tokio::net::lookup_host(addr.as_str())
            .await
            .map_err(bind_err)?
            .next()
            .ok_or_else(|| {
                bind_err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "address resolved to nothing",
                ))
            })?;

        let listener = create_listener(socket_addr)
            .and_then(TcpListener::from_std)
            .map_err(bind_err)?;

        if let Ok(local) = listener.local_addr() {
            info!(address = %local, "Server listening");
        }

        Ok(Self::with_acceptor(listener, config))
    }

    /// Address the socket is actually bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.acceptor.local_addr()
    }
}

impl<A: Acceptor> Listener<A> {
    fn with_acceptor(acceptor: A, config: &Config) -> Self {
        let connection_limit =
            (config.max_connections > 0).then(|| Arc::new(Semaphore::new(config.max_connections)));

        Self {
            acceptor,
            options: HandlerOptions::from(config),
            connection_limit,
            active: ActiveConnections::default(),
            backoff: Backoff::default(),
        }
    }

    /// Handle for observing the number of live connections.
    #[cfg(test)]
    pub fn active_connections(&self) -> ActiveConnections {
        self.active.clone()
    }

    /// Signal-free entry point: accept connections forever. Returns only on a
    /// fatal accept error. The binary itself goes through
    /// [`serve_with_shutdown`](Self::serve_with_shutdown) to react to Ctrl-C.
    #[allow(dead_code)]
    pub async fn serve(self) -> Result<(), ServerError> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Accept connections until `signal` completes or a fatal accept error
    /// occurs. On the way out the listening socket is closed, every handler
    /// is told to stop, and all handlers are waited for.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let (notify, shutdown) = watch::channel(false);
        let mut handlers = JoinSet::new();
        let mut backoff = self.backoff;

        tokio::pin!(signal);

        let result = loop {
            tokio::select! {
                _ = &mut signal => {
                    info!("Shutdown requested");
                    break Ok(());
                }
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    report_panic(joined);
                }
                accepted = self.next_connection() => match accepted {
                    Ok((stream, peer, permit)) => {
                        backoff.reset();
                        debug!(peer = %peer, "New connection");

                        let guard = ConnectionGuard::new(&self.active, peer, permit);
                        let handler = ConnectionHandler::new(
                            stream,
                            peer,
                            self.options.clone(),
                            shutdown.clone(),
                        );

                        handlers.spawn(async move {
                            let _guard = guard;
                            handler.run().await
                        });
                    }
                    Err(e) => match AcceptErrorKind::classify(&e) {
                        AcceptErrorKind::Transient => {
                            let delay = backoff.next_delay();
                            warn!(error = %e, retry_in = ?delay, "Transient accept error");

                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = &mut signal => {
                                    info!("Shutdown requested");
                                    break Ok(());
                                }
                            }
                        }
                        // Reported once by whoever receives the error.
                        AcceptErrorKind::Fatal => break Err(ServerError::Accept(e)),
                    },
                },
            }
        };

        drop(self.acceptor);
        let _ = notify.send(true);

        if !handlers.is_empty() {
            info!(connections = self.active.count(), "Waiting for connections to close");
        }
        while let Some(joined) = handlers.join_next().await {
            report_panic(joined);
        }

        result
    }

    /// Wait for an admission slot (when bounded), then accept.
    async fn next_connection(
        &self,
    ) -> io::Result<(A::Stream, SocketAddr, Option<OwnedSemaphorePermit>)> {
        let permit = match &self.connection_limit {
            Some(limit) => Some(
                Arc::clone(limit)
                    .acquire_owned()
                    .await
                    .map_err(io::Error::other)?,
            ),
            None => None,
        };

        let (stream, peer) = self.acceptor.accept().await?;
        Ok((stream, peer, permit))
    }
}

fn report_panic<T>(joined: Result<T, tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "Connection handler panicked");
        }
    }
}

/// Create a non-blocking listening socket with SO_REUSEADDR set.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}
