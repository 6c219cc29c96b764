//! Listening endpoint and connection handoff.
//!
//! The acceptor owns the listen socket. Each accepted socket gets its
//! options set (TCP_NODELAY, SO_KEEPALIVE, buffer sizes), optional TLS
//! termination under the connect deadline, a fresh connection id, a
//! registry entry in Connecting, and its pair of I/O drivers.
//!
//! Accept errors are logged and retried; descriptor exhaustion backs off
//! for 100 ms. Accepts beyond `limits.max_connections` are rejected
//! immediately.
//!
//! Graceful shutdown: stop accepting, move every connection to
//! Disconnecting in parallel, wait up to five seconds for drains, close the
//! listen socket, clear the registry last.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::config::{ServerConfig, CONNECT_TIMEOUT, SHUTDOWN_TIMEOUT};
use crate::error::{ChatError, Result};
use crate::service::auth::{AuthService, CredentialVerifier};
use crate::service::connection::{run_connection, ConnectionContext, ConnectionHandle};
use crate::service::registry::Registry;
use crate::service::scheduler;
use crate::transport::tls;
use crate::utils::metrics::global_metrics;

/// Back-off after EMFILE/ENFILE on accept.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Remote trigger for server shutdown.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    /// Signal the server to drain and stop.
    pub fn shutdown(&self) {
        let _ = self.0.send(true);
    }
}

/// The bound server, ready to accept.
pub struct ChatServer {
    listener: TcpListener,
    registry: Arc<Registry>,
    auth: Arc<AuthService>,
    config: Arc<ServerConfig>,
    tls_acceptor: Option<TlsAcceptor>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    next_id: AtomicU64,
    scheduler: tokio::task::JoinHandle<()>,
}

impl ChatServer {
    /// Validate the configuration, bind the listen socket, and start the
    /// scheduler.
    pub async fn bind(
        config: ServerConfig,
        verifier: Box<dyn CredentialVerifier>,
    ) -> Result<Self> {
        config.validate_strict()?;

        let tls_acceptor = if config.tls.enabled {
            Some(TlsAcceptor::from(Arc::new(tls::load_server_config(
                &config.tls,
            )?)))
        } else {
            None
        };

        let addr = config.listen.socket_addr()?;
        let listener = TcpListener::bind(addr).await.map_err(ChatError::BindFailed)?;

        let config = Arc::new(config);
        let registry = Arc::new(Registry::new());
        let auth = Arc::new(AuthService::new(verifier));
        let (shutdown_tx, _) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);

        let scheduler = scheduler::spawn(
            registry.clone(),
            config.clone(),
            shutdown_tx.subscribe(),
        );

        Ok(Self {
            listener,
            registry,
            auth,
            config,
            tls_acceptor,
            shutdown_tx,
            next_id: AtomicU64::new(1),
            scheduler,
        })
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(ChatError::Io)
    }

    /// Directory of live connections (shared with the drivers).
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Trigger for graceful shutdown, usable from signal handlers.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown_tx.clone())
    }

    /// Accept connections until shutdown is signalled, then drain.
    pub async fn run(self) -> Result<()> {
        let Self {
            listener,
            registry,
            auth,
            config,
            tls_acceptor,
            shutdown_tx,
            next_id,
            scheduler,
        } = self;

        let mut shutdown = shutdown_tx.subscribe();
        info!(
            address = %listener.local_addr().map_err(ChatError::Io)?,
            tls = tls_acceptor.is_some(),
            max_connections = config.limits.max_connections,
            "server listening"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => accept_connection(
                            stream,
                            peer,
                            &registry,
                            &auth,
                            &config,
                            &tls_acceptor,
                            &shutdown_tx,
                            &next_id,
                        ),
                        Err(e) => {
                            error!(error = %e, "accept failed");
                            // EMFILE/ENFILE: give the reaper a chance to
                            // release descriptors.
                            if matches!(e.raw_os_error(), Some(23) | Some(24)) {
                                tokio::time::sleep(ACCEPT_BACKOFF).await;
                            }
                        }
                    }
                }
            }
        }

        // Drain phase: no new accepts, all connections to Disconnecting.
        info!("shutdown signalled, draining connections");
        for conn in registry.connections() {
            conn.begin_disconnect();
        }

        let deadline = Instant::now() + SHUTDOWN_TIMEOUT;
        while !registry.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if !registry.is_empty() {
            warn!(
                remaining = registry.len(),
                "drain deadline reached with connections still open"
            );
        }

        drop(listener);
        if timeout(Duration::from_secs(1), scheduler).await.is_err() {
            debug!("scheduler did not stop in time");
        }

        // The registry is torn down last.
        registry.clear();
        info!("server stopped");
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
fn accept_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: &Arc<Registry>,
    auth: &Arc<AuthService>,
    config: &Arc<ServerConfig>,
    tls_acceptor: &Option<TlsAcceptor>,
    shutdown_tx: &Arc<watch::Sender<bool>>,
    next_id: &AtomicU64,
) {
    if registry.len() >= config.limits.max_connections {
        global_metrics().connection_rejected();
        warn!(%peer, cap = config.limits.max_connections, "connection cap reached, rejecting");
        drop(stream);
        return;
    }

    if let Err(e) = configure_socket(&stream, config) {
        warn!(%peer, error = %e, "socket option setup failed");
    }

    let id = next_id.fetch_add(1, Ordering::Relaxed);
    let handle = ConnectionHandle::new(id, &config.send);
    registry.insert(handle.clone());

    let ctx = ConnectionContext {
        registry: registry.clone(),
        auth: auth.clone(),
        config: config.clone(),
        shutdown: shutdown_tx.subscribe(),
    };
    let tls_acceptor = tls_acceptor.clone();
    let registry = registry.clone();

    debug!(conn = id, %peer, "accepted connection");
    tokio::spawn(async move {
        match tls_acceptor {
            Some(acceptor) => match timeout(CONNECT_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(tls_stream)) => run_connection(tls_stream, handle, ctx).await,
                Ok(Err(e)) => {
                    warn!(conn = id, %peer, error = %e, "TLS handshake failed");
                    registry.unregister(id);
                }
                Err(_) => {
                    warn!(conn = id, %peer, "TLS handshake timed out");
                    registry.unregister(id);
                }
            },
            None => run_connection(stream, handle, ctx).await,
        }
    });
}

fn configure_socket(stream: &TcpStream, config: &ServerConfig) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let sock = socket2::SockRef::from(stream);
    sock.set_keepalive(true)?;
    sock.set_recv_buffer_size(config.listen.recv_buffer_size)?;
    sock.set_send_buffer_size(config.listen.send_buffer_size)?;
    Ok(())
}
