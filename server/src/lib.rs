//! gNMI dial-out collector.
//!
//! A [`DialoutServer`] listens for outbound connections from telemetry
//! producers, drives the TLS and credential handshake each session
//! requires, and dispatches decoded batches to a registered
//! [`BatchHandler`]. Every session runs on its own thread; a failing or
//! slow session never affects its siblings or the accept loop.
//!
//! ```no_run
//! use dialout_common::ServerOptions;
//! use dialout_server::DialoutServer;
//!
//! let opts = ServerOptions::new()
//!     .with_skip_verify(true)
//!     .with_cert_file("tls/server.crt")
//!     .with_key_file("tls/server.key")
//!     .with_credentials("myaccount", "mypassword");
//!
//! let server = DialoutServer::new("0.0.0.0:8088", opts)?
//!     .with_handler(|session: &dialout_server::SessionInfo, batch: dialout_common::Batch| {
//!         println!("{} messages from {}", batch.len(), session.peer);
//!     });
//! server.serve()?;
//! # Ok::<(), dialout_common::DialoutError>(())
//! ```

mod session;

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use dialout_common::{tls, Credentials, DialoutError, Result, ServerOptions};
use rustls::ServerConfig;
use uuid::Uuid;

pub use session::{BatchHandler, NoopHandler, SessionInfo};

use session::{SessionContext, SessionRegistry};

/// How often the accept loop polls the shutdown flag.
const ACCEPT_POLL: Duration = Duration::from_millis(10);
/// How long close waits for sessions to drain before aborting them.
const CLOSE_GRACE: Duration = Duration::from_secs(3);
/// How long close waits for aborted sessions to deregister.
const ABORT_WAIT: Duration = Duration::from_millis(250);

/// Recorded outcome of the first close call. `None` means not closed yet.
type CloseState = Option<Option<String>>;

/// The collector endpoint of the dial-out transport.
///
/// Owns every session it accepts: sessions register on accept, deregister
/// on exit, and [`close`](DialoutServer::close) drains the registry.
pub struct DialoutServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    tls_config: Option<Arc<ServerConfig>>,
    client_cert_verified: bool,
    credentials: Option<Credentials>,
    handler: Arc<dyn BatchHandler>,
    shutdown: Arc<AtomicBool>,
    registry: Arc<SessionRegistry>,
    serving: AtomicBool,
    close_state: Mutex<CloseState>,
}

impl DialoutServer {
    /// Validate the security options, bind the listener, and return a
    /// server ready to [`serve`](DialoutServer::serve). Fails with
    /// [`DialoutError::Configuration`] on an invalid option combination or
    /// unusable TLS material, and [`DialoutError::Transport`] if the
    /// address cannot be bound. No partially-open server is returned.
    pub fn new<A: std::net::ToSocketAddrs>(address: A, options: ServerOptions) -> Result<Self> {
        let tls_config = tls::server_tls_config(&options)?;
        let client_cert_verified = tls_config.is_some() && !options.skip_verify;
        let credentials = options.required_credentials();

        let listener = TcpListener::bind(address)?;
        // Non-blocking accept lets the loop poll the shutdown flag.
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        tracing::info!(
            addr = %local_addr,
            tls = tls_config.is_some(),
            mutual = client_cert_verified,
            credentials = credentials.is_some(),
            "dial-out collector listening"
        );

        Ok(Self {
            listener,
            local_addr,
            tls_config,
            client_cert_verified,
            credentials,
            handler: Arc::new(NoopHandler),
            shutdown: Arc::new(AtomicBool::new(false)),
            registry: Arc::new(SessionRegistry::default()),
            serving: AtomicBool::new(false),
            close_state: Mutex::new(None),
        })
    }

    /// Install the batch handler. Replaces the default no-op handler;
    /// must be called before [`serve`](DialoutServer::serve).
    pub fn with_handler<H: BatchHandler + 'static>(mut self, handler: H) -> Self {
        self.handler = Arc::new(handler);
        self
    }

    /// The bound address, useful when constructed with port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of sessions currently registered.
    pub fn active_sessions(&self) -> usize {
        self.registry.len()
    }

    /// Run the accept loop, blocking the calling thread until
    /// [`close`](DialoutServer::close). Each accepted connection is served
    /// on its own thread; handshake, authentication, or stream failures
    /// terminate only the session they occur on.
    pub fn serve(&self) -> Result<()> {
        if self.close_guard().is_some() {
            return Err(DialoutError::Closed);
        }
        if self.serving.swap(true, Ordering::SeqCst) {
            return Err(DialoutError::InvalidState(
                "serve is already running".to_string(),
            ));
        }

        while !self.shutdown.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((socket, peer)) => self.spawn_session(socket, peer),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    if self.shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    tracing::error!(error = %e, "accept failed");
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }

        self.serving.store(false, Ordering::SeqCst);
        tracing::info!(addr = %self.local_addr, "accept loop stopped");
        Ok(())
    }

    fn spawn_session(&self, socket: TcpStream, peer: SocketAddr) {
        let id = Uuid::new_v4();
        tracing::debug!(session = %id, peer = %peer, "connection accepted");

        // The accepted socket must block; only the listener polls.
        if let Err(e) = socket.set_nonblocking(false) {
            tracing::error!(session = %id, error = %e, "failed to configure socket");
            return;
        }

        // Register a duplicate handle before the handshake so close can
        // abort a session stuck mid-handshake.
        let watchdog = match socket.try_clone() {
            Ok(clone) => clone,
            Err(e) => {
                tracing::error!(session = %id, error = %e, "failed to clone session socket");
                return;
            }
        };
        self.registry.register(id, watchdog);

        let ctx = SessionContext {
            id,
            peer,
            tls_config: self.tls_config.clone(),
            client_cert_verified: self.client_cert_verified,
            required_credentials: self.credentials.clone(),
            handler: Arc::clone(&self.handler),
            shutdown: Arc::clone(&self.shutdown),
        };
        let registry = Arc::clone(&self.registry);

        let spawned = thread::Builder::new()
            .name(format!("dialout-session-{id}"))
            .spawn(move || {
                match session::serve_session(ctx, socket) {
                    Ok(()) => {}
                    Err(e @ DialoutError::Authentication(_)) => {
                        tracing::warn!(session = %id, error = %e, "session rejected");
                    }
                    Err(e) => {
                        tracing::error!(session = %id, error = %e, "session failed");
                    }
                }
                registry.deregister(id);
            });

        if let Err(e) = spawned {
            tracing::error!(session = %id, error = %e, "failed to spawn session thread");
            self.registry.deregister(id);
        }
    }

    /// Stop accepting connections and terminate every open session:
    /// cooperative shutdown signal first, a bounded grace period for the
    /// drain, then a forced abort of any straggler. Idempotent; repeated
    /// calls return the first recorded outcome. Safe to call concurrently
    /// with a running [`serve`](DialoutServer::serve) loop and from within
    /// a handler (it never joins session threads).
    pub fn close(&self) -> Result<()> {
        let mut state = self.lock_close_state();
        if let Some(previous) = &*state {
            return match previous {
                None => Ok(()),
                Some(msg) => Err(DialoutError::Shutdown(msg.clone())),
            };
        }

        tracing::info!(addr = %self.local_addr, "closing collector");
        self.shutdown.store(true, Ordering::SeqCst);

        let deadline = Instant::now() + CLOSE_GRACE;
        while self.registry.len() > 0 && Instant::now() < deadline {
            thread::sleep(ACCEPT_POLL);
        }

        let mut first_error: Option<String> = None;
        let stragglers = self.registry.len();
        if stragglers > 0 {
            tracing::warn!(stragglers, "grace period expired; aborting sessions");
            for error in self.registry.abort_all() {
                if first_error.is_none() {
                    first_error = Some(error);
                } else {
                    tracing::warn!(error = %error, "additional shutdown error");
                }
            }

            let abort_deadline = Instant::now() + ABORT_WAIT;
            while self.registry.len() > 0 && Instant::now() < abort_deadline {
                thread::sleep(ACCEPT_POLL);
            }

            // Sessions that survived the forced abort (a handler still
            // running, for instance) make the close outcome an error.
            let undrained = self.registry.len();
            if undrained > 0 {
                tracing::warn!(undrained, "sessions still active after forced abort");
                if first_error.is_none() {
                    first_error = Some(format!(
                        "{undrained} session(s) still active after forced abort"
                    ));
                }
            }
        }

        tracing::info!(addr = %self.local_addr, "collector closed");
        *state = Some(first_error.clone());
        match first_error {
            None => Ok(()),
            Some(msg) => Err(DialoutError::Shutdown(msg)),
        }
    }

    fn lock_close_state(&self) -> MutexGuard<'_, CloseState> {
        self.close_state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn close_guard(&self) -> CloseState {
        self.lock_close_state().clone()
    }
}

impl Drop for DialoutServer {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
