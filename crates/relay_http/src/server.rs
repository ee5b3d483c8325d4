// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [`Server`]-related things

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, Stream, StreamExt};
use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::{service_fn, HttpService};
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::{watch, Semaphore};
use tokio::time::sleep;
use tracing::{error, info, info_span, warn, Instrument, Span};

use crate::nursery::Nursery;
use crate::response::GenericResponse;

/// Errors that can occur while serving a connection
#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
    #[error("could not accept connection: {0}")]
    Accept(#[from] std::io::Error),
    #[error("too overloaded to serve {peer_addr}")]
    Overloaded { peer_addr: SocketAddr },
    #[error("error serving {peer_addr} connection: {source}")]
    Http {
        peer_addr: SocketAddr,
        source: hyper::Error,
    },
}

/// Serves HTTP/1 connections, with support for protocol upgrades, while allowing for
/// graceful shutdowns.
///
/// Upgraded connections (e.g. websockets) are handed off to whoever called
/// [`hyper::upgrade::on`] and are no longer tracked by the [`Server`]; their owners are
/// responsible for observing shutdown themselves.
pub struct Server {
    concurrent_requests: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
}

impl Server {
    /// `max_connections` is the maximum number of simultaneous connections that may be handled
    /// across all [`serve`](Self::serve) calls before they start responding with 503s.
    pub fn new(max_connections: usize) -> Self {
        let concurrent_requests = Arc::new(Semaphore::new(max_connections));
        let (shutdown, _) = watch::channel(false);
        Self {
            concurrent_requests,
            shutdown,
        }
    }

    /// Serve incoming `connections` with `responder`.
    ///
    /// Each connection is handled in its own task. [`serve`](Self::serve) resolves after
    /// [`graceful_shutdown`](Self::graceful_shutdown) has been called (or `connections` is
    /// exhausted) and none of its connections remain.
    ///
    /// If the [`Server`] is already at its `max_connections` limit, new connections are
    /// answered with a single minimal 503.
    ///
    /// # Cancel Safety
    ///
    /// Cancellation is propagated to every connection handled by this call and blocks until
    /// they have all terminated.
    pub async fn serve<P, C, R, F>(&self, connections: P, responder: R)
    where
        P: Stream<Item = std::io::Result<(C, SocketAddr)>>,
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
        R: Fn(Request<Incoming>, SocketAddr) -> F + Clone + Send + Sync + 'static,
        F: Future<Output = GenericResponse> + Send,
    {
        let respond = move |request: Request<Incoming>, peer_addr| {
            let respond = responder.clone();
            async move {
                info!("Request: {} {}", request.method(), request.uri().path());
                let response = respond(request, peer_addr).await;
                info!("Response: {}", response.status());
                response
            }
        };

        // This receiver is what keeps graceful_shutdown from returning, so it has to be
        // created first and destroyed last.
        let mut shutdown_receiver = self.shutdown.subscribe();
        let mut was_shutdown = pin!(shutdown_receiver.wait_for(|&done| done).map(|_| None));

        async fn either<T>(f1: impl Future<Output = T>, f2: impl Future<Output = T>) -> T {
            select! {
                biased; // never accept connections once shut down
                x1 = f1 => x1,
                x2 = f2 => x2,
            }
        }

        let mut nursery = Nursery::new();

        info!("Started serving");

        // scope forces `connections` to be dropped before waiting on the nursery
        {
            let mut connections = pin!(connections);
            while let Some(accepted) = either(&mut was_shutdown, connections.next()).await {
                let (connection, peer_addr) = match accepted {
                    Ok(a) => a,
                    Err(err) => {
                        error!("{}", ConnectionError::from(err));
                        continue;
                    }
                };

                let connection_span = info_span!("connection", addr=%peer_addr);
                async {
                    info!("Connected.");
                    let permit = match self.concurrent_requests.clone().try_acquire_owned() {
                        Ok(p) => p,
                        Err(_) => {
                            warn!("{}", ConnectionError::Overloaded { peer_addr });
                            let _ = respond_with_temporarily_unavailable(connection).await;
                            info!("Disconnected.");
                            return;
                        }
                    };

                    let respond = respond.clone();
                    let service =
                        service_fn(move |r| respond(r, peer_addr).map(Ok::<_, Infallible>));
                    let mut shutdown_receiver = self.shutdown.subscribe();
                    let connection_task = async move {
                        let wants_shutdown = shutdown_receiver.wait_for(|&done| done);
                        let _permit = permit;

                        let http_connection = http1::Builder::new()
                            .half_close(true)
                            .serve_connection(TokioIo::new(connection), service)
                            .with_upgrades();
                        let http_connection =
                            with_graceful_shutdown(http_connection, wants_shutdown);

                        if let Err(source) = http_connection.await {
                            error!("{}", ConnectionError::Http { peer_addr, source });
                        }
                        info!("Disconnected.");
                    };
                    nursery.spawn(connection_task.instrument(Span::current()));
                }
                .instrument(connection_span.or_current())
                .await;
            }
        }

        nursery.finish().await;
        info!("Stopped serving");
    }

    /// Serve every connection accepted by `listener`. See [`serve`](Self::serve).
    pub async fn serve_listener<R, F>(&self, listener: TcpListener, responder: R)
    where
        R: Fn(Request<Incoming>, SocketAddr) -> F + Clone + Send + Sync + 'static,
        F: Future<Output = GenericResponse> + Send,
    {
        let connections = futures::stream::unfold(listener, |listener| async {
            Some((listener.accept().await, listener))
        });
        self.serve(connections, responder).await
    }

    /// Gracefully shuts down server.
    ///
    /// New calls to [`serve`](Self::serve) resolve immediately. Existing calls drop their
    /// stream of connections, then wait for their ongoing connections to finish their current
    /// request. Idle connections are terminated immediately.
    ///
    /// # Cancel Safety
    ///
    /// After this has been polled, canceling does not stop the shutdown.
    pub async fn graceful_shutdown(&self) {
        self.shutdown.send_replace(true);
        self.shutdown.closed().await;
    }

    /// A receiver that flips to `true` once a graceful shutdown starts.
    ///
    /// Owners of upgraded connections use this to wind down alongside the server.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

/// Cheaply responds to an HTTP 1 connection with a minimal 503.
async fn respond_with_temporarily_unavailable(
    mut connection: impl AsyncWriteExt + Unpin,
) -> std::io::Result<()> {
    // Skip parsing the request entirely; an overloaded server shouldn't spend more on a
    // client than a single small write.
    let write_response = async {
        let msg = b"HTTP/1.1 503 Service Unavailable\r\n\
                    Content-Type: text/plain;charset=utf-8\r\n\
                    Content-Length: 22\r\n\
                    \r\n\
                    Too many connections!\n";
        connection.write_all(msg).await?;
        connection.shutdown().await
    };
    select! {
         result = write_response => result,
         _ = sleep(Duration::from_secs(1)) => Err(std::io::ErrorKind::TimedOut.into()),
    }
}

/// Gracefully terminate `connection` if `want_shutdown` resolves.
async fn with_graceful_shutdown<I, S, B>(
    connection: http1::UpgradeableConnection<I, S>,
    want_shutdown: impl Future,
) -> Result<(), hyper::Error>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
    S: HttpService<Incoming, ResBody = B>,
    S::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    B: Body + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    // Polling and gracefully shutting down both need exclusive access.
    let mut connection = pin!(connection);
    let mut want_shutdown = pin!(want_shutdown.fuse());
    std::future::poll_fn(|cx| {
        if want_shutdown.as_mut().poll(cx).is_ready() {
            connection.as_mut().graceful_shutdown();
        }
        connection.as_mut().poll(cx)
    })
    .await
}
