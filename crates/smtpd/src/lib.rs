//! An embeddable SMTP/ESMTP server engine.
//!
//! The engine owns the protocol: connection lifecycle, command
//! sequencing, STARTTLS, AUTH, DATA streaming with a size cap, and
//! graceful shutdown. Everything that makes a *mail server* out of it
//! (who may connect, which senders and recipients are acceptable, what
//! happens to an accepted message) is delegated to a [`Policy`] and an
//! optional [`Authenticator`].
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};
use tokio_rustls::TlsAcceptor;

mod conn;
mod envelope;
mod errors;
mod line_io;
mod parser;
mod session;

pub use envelope::{Envelope, HeaderMap, Peer, Protocol, TlsInfo};
pub use errors::Error;

use conn::SessionStream;
use session::Session;

/// Admission policy and message handler for a [`Server`]. All checks
/// default to allow; `deliver` decides the fate of each accepted
/// message and its result becomes the reply to the final `DATA` dot.
#[async_trait]
pub trait Policy: Send + Sync {
    async fn check_connection(&self, _peer: &Peer) -> Result<(), Error> {
        Ok(())
    }

    async fn check_helo(&self, _peer: &Peer, _name: &str) -> Result<(), Error> {
        Ok(())
    }

    async fn check_sender(&self, _peer: &Peer, _addr: &str) -> Result<(), Error> {
        Ok(())
    }

    async fn check_recipient(&self, _peer: &Peer, _addr: &str) -> Result<(), Error> {
        Ok(())
    }

    /// Optional upper bound on the lifetime of one connection. The
    /// engine tears an expired connection down without a reply; the
    /// server itself is unaffected.
    fn connection_deadline(&self, _peer: &Peer) -> Option<Duration> {
        None
    }

    async fn deliver(&self, peer: &Peer, envelope: Envelope) -> Result<(), Error>;
}

/// Credential validation for AUTH PLAIN/LOGIN. Configuring an
/// authenticator is what makes the engine advertise AUTH (under TLS)
/// and require it before MAIL.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, peer: &Peer, username: &str, password: &str)
        -> Result<(), Error>;
}

/// Engine knobs. The zero-ish defaults match a small standalone server;
/// a relay will want to fill most of these in.
#[derive(Clone)]
pub struct ServerConfig {
    pub hostname: String,
    /// Banner text; when empty, `"<hostname> ESMTP ready."` is used.
    pub welcome_message: String,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Budget for the whole DATA phase.
    pub data_timeout: Duration,
    /// Live-session cap; `None` disables the cap.
    pub max_connections: Option<usize>,
    pub max_message_size: usize,
    pub max_recipients: usize,
    /// Present when STARTTLS (or a TLS listener) should be available.
    pub tls: Option<Arc<tokio_rustls::rustls::ServerConfig>>,
    /// Refuse MAIL until the session has upgraded to TLS.
    pub force_tls: bool,
    pub enable_xclient: bool,
    pub enable_proxy: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: gethostname::gethostname().to_string_lossy().into_owned(),
            welcome_message: String::new(),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(60),
            data_timeout: Duration::from_secs(5 * 60),
            max_connections: Some(100),
            max_message_size: 10_240_000,
            max_recipients: 100,
            tls: None,
            force_tls: false,
            enable_xclient: false,
            enable_proxy: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Sentinel returned by `serve` once `shutdown` has been called.
    #[error("smtpd: server closed")]
    Closed,
    #[error("smtpd: server has not been shut down")]
    NotShutdown,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The listener/accept half of the engine. One `Server` may serve any
/// number of listeners; they share the connection cap and the shutdown
/// signal.
pub struct Server {
    config: ServerConfig,
    policy: Arc<dyn Policy>,
    authenticator: Option<Arc<dyn Authenticator>>,
    shutdown_tx: watch::Sender<bool>,
    live_sessions: AtomicUsize,
    idle: Notify,
}

impl Server {
    pub fn new(config: ServerConfig, policy: Arc<dyn Policy>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            policy,
            authenticator: None,
            shutdown_tx,
            live_sessions: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub(crate) fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub(crate) fn policy(&self) -> &Arc<dyn Policy> {
        &self.policy
    }

    pub(crate) fn authenticator(&self) -> Option<&Arc<dyn Authenticator>> {
        self.authenticator.as_ref()
    }

    /// Accept connections until `shutdown` is called (returning the
    /// [`ServerError::Closed`] sentinel) or the listener fails.
    /// Sessions in flight keep running after this returns.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        serve_inner(self, listener, false).await
    }

    /// Like [`Server::serve`], but the socket speaks TLS from the first
    /// byte (a `tls://` listener). Requires `config.tls`.
    pub async fn serve_tls(self: Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        if self.config.tls.is_none() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "serve_tls requires a TLS configuration",
            )
            .into());
        }
        serve_inner(self, listener, true).await
    }

    /// Stop accepting: every `serve` call returns `Closed`, dropping
    /// its listener. In-flight sessions are left to finish; see
    /// [`Server::wait`].
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Block until the live-session count reaches zero. Refuses to wait
    /// on a server that hasn't been shut down.
    pub async fn wait(&self) -> Result<(), ServerError> {
        if !*self.shutdown_tx.borrow() {
            return Err(ServerError::NotShutdown);
        }

        loop {
            let idle = self.idle.notified();
            if self.live_sessions.load(Ordering::SeqCst) == 0 {
                return Ok(());
            }
            idle.await;
        }
    }
}

async fn serve_inner(
    server: Arc<Server>,
    listener: TcpListener,
    implicit_tls: bool,
) -> Result<(), ServerError> {
    if *server.shutdown_tx.borrow() {
        return Err(ServerError::Closed);
    }
    let mut shutdown = server.shutdown_tx.subscribe();

    loop {
        tokio::select! {
            _ = shutdown.changed() => return Err(ServerError::Closed),
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, addr)) => start_session(&server, socket, addr, implicit_tls),
                    Err(err) => {
                        if *server.shutdown_tx.borrow() {
                            return Err(ServerError::Closed);
                        }
                        // Transient accept failure (eg: EMFILE).
                        tracing::warn!("accept failed: {err:#}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
}

fn start_session(server: &Arc<Server>, socket: TcpStream, addr: SocketAddr, implicit_tls: bool) {
    if let Some(max) = server.config.max_connections {
        if server.live_sessions.load(Ordering::SeqCst) >= max {
            tracing::warn!(%addr, "connection cap reached, turning peer away");
            let busy = Error::busy();
            let write_timeout = server.config.write_timeout;
            tokio::spawn(async move {
                let mut socket = socket;
                let line = format!("{} {}\r\n", busy.code, busy.message);
                let _ =
                    tokio::time::timeout(write_timeout, socket.write_all(line.as_bytes())).await;
            });
            return;
        }
    }

    server.live_sessions.fetch_add(1, Ordering::SeqCst);

    let server = Arc::clone(server);
    tokio::spawn(async move {
        run_session(&server, socket, addr, implicit_tls).await;
        if server.live_sessions.fetch_sub(1, Ordering::SeqCst) == 1 {
            server.idle.notify_waiters();
        }
    });
}

async fn run_session(server: &Arc<Server>, socket: TcpStream, addr: SocketAddr, implicit_tls: bool) {
    let stream = if implicit_tls {
        let acceptor = TlsAcceptor::from(
            server
                .config
                .tls
                .clone()
                .expect("serve_tls checked the TLS configuration"),
        );
        let handshake = tokio::time::timeout(server.config.read_timeout, acceptor.accept(socket));
        match handshake.await {
            Ok(Ok(tls)) => SessionStream::Tls(Box::new(tls)),
            Ok(Err(err)) => {
                tracing::debug!(%addr, "TLS accept failed: {err:#}");
                return;
            }
            Err(_) => {
                tracing::debug!(%addr, "TLS accept timed out");
                return;
            }
        }
    } else {
        SessionStream::Plain(socket)
    };

    Session::new(Arc::clone(server), stream, addr).run().await;
}
