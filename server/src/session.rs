//! One accepted dial-out session: handshake, credential check, receive
//! loop, and the registry the server drains on close.

use std::collections::HashMap;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use dialout_common::{Batch, Credentials, DialoutError, DialoutStream, Frame, Result};
use rustls::{ServerConfig, ServerConnection};
use uuid::Uuid;

/// Identity of one authenticated session, handed to the batch handler.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: Uuid,
    pub peer: SocketAddr,
    /// Whether the peer proved its identity at session start, either by
    /// matching the required credentials or by presenting a CA-validated
    /// client certificate.
    pub peer_authenticated: bool,
    pub opened_at: SystemTime,
}

/// Receives decoded batches. Invoked on the owning session's thread, so
/// implementations must not assume mutual exclusion with other sessions.
pub trait BatchHandler: Send + Sync {
    fn handle_batch(&self, session: &SessionInfo, batch: Batch);
}

impl<F> BatchHandler for F
where
    F: Fn(&SessionInfo, Batch) + Send + Sync,
{
    fn handle_batch(&self, session: &SessionInfo, batch: Batch) {
        self(session, batch)
    }
}

/// Default handler: drops every batch, logging at debug level.
pub struct NoopHandler;

impl BatchHandler for NoopHandler {
    fn handle_batch(&self, session: &SessionInfo, batch: Batch) {
        tracing::debug!(
            session = %session.id,
            messages = batch.len(),
            "batch received (no handler registered)"
        );
    }
}

/// Live-session accounting. Holds a duplicate handle of each session's
/// socket so close can abort sessions blocked in a read.
#[derive(Default)]
pub(crate) struct SessionRegistry {
    sockets: Mutex<HashMap<Uuid, TcpStream>>,
}

impl SessionRegistry {
    pub(crate) fn register(&self, id: Uuid, socket: TcpStream) {
        self.lock().insert(id, socket);
    }

    pub(crate) fn deregister(&self, id: Uuid) {
        self.lock().remove(&id);
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    /// Shut down every registered socket. Sessions notice the dead socket,
    /// exit their loops, and deregister themselves. Returns one message
    /// per socket that failed to shut down.
    pub(crate) fn abort_all(&self) -> Vec<String> {
        let mut errors = Vec::new();
        for (id, socket) in self.lock().iter() {
            if let Err(e) = socket.shutdown(Shutdown::Both) {
                if e.kind() != std::io::ErrorKind::NotConnected {
                    errors.push(format!("session {id}: {e}"));
                }
            }
        }
        errors
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, TcpStream>> {
        self.sockets.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub(crate) struct SessionContext {
    pub id: Uuid,
    pub peer: SocketAddr,
    pub tls_config: Option<Arc<ServerConfig>>,
    /// True when the TLS posture already validated the peer certificate.
    pub client_cert_verified: bool,
    pub required_credentials: Option<Credentials>,
    pub handler: Arc<dyn BatchHandler>,
    pub shutdown: Arc<AtomicBool>,
}

/// Drive one session from raw socket to teardown. The caller deregisters
/// the session and logs whatever this returns.
pub(crate) fn serve_session(ctx: SessionContext, socket: TcpStream) -> Result<()> {
    let mut stream = match &ctx.tls_config {
        Some(config) => {
            let conn = ServerConnection::new(Arc::clone(config))?;
            DialoutStream::from_server(socket, conn)?
        }
        None => DialoutStream::plain(socket),
    };

    let info = authenticate(&ctx, &mut stream)?;
    tracing::info!(
        session = %info.id,
        peer = %info.peer,
        authenticated = info.peer_authenticated,
        "session admitted"
    );

    let result = receive_loop(&ctx, &info, &mut stream);
    stream.close();
    tracing::info!(session = %info.id, "session closed");
    result
}

/// Exactly-once authentication at session start: read the opening `Hello`
/// and check it against the required credentials, if any.
fn authenticate(ctx: &SessionContext, stream: &mut DialoutStream) -> Result<SessionInfo> {
    let (username, password) = match stream.recv_frame()? {
        Frame::Hello { username, password } => (username, password),
        other => {
            stream.close();
            return Err(protocol_error(format!(
                "expected hello, got {}",
                frame_name(&other)
            )));
        }
    };

    let credentials_checked = match &ctx.required_credentials {
        Some(want) => {
            let matched = username.as_deref() == Some(want.username.as_str())
                && password.as_deref() == Some(want.password.as_str());
            if !matched {
                let _ = stream.send_frame(&Frame::AuthReject {
                    reason: "invalid credentials".to_string(),
                });
                stream.close();
                let who = username.as_deref().unwrap_or("<none>");
                return Err(DialoutError::Authentication(format!(
                    "peer {} presented invalid credentials (username {who:?})",
                    ctx.peer
                )));
            }
            true
        }
        None => false,
    };

    stream.send_frame(&Frame::HelloAck)?;

    Ok(SessionInfo {
        id: ctx.id,
        peer: ctx.peer,
        peer_authenticated: credentials_checked || ctx.client_cert_verified,
        opened_at: SystemTime::now(),
    })
}

fn receive_loop(
    ctx: &SessionContext,
    info: &SessionInfo,
    stream: &mut DialoutStream,
) -> Result<()> {
    loop {
        if ctx.shutdown.load(Ordering::SeqCst) {
            tracing::debug!(session = %info.id, "session observes shutdown");
            return Ok(());
        }

        match stream.recv_frame() {
            Ok(Frame::Batch(batch)) => {
                // An empty batch is a legal no-op and never reaches the handler.
                if batch.is_empty() {
                    continue;
                }
                tracing::debug!(session = %info.id, messages = batch.len(), "batch received");
                ctx.handler.handle_batch(info, batch);
            }
            Ok(Frame::Goodbye) => {
                tracing::debug!(session = %info.id, "producer said goodbye");
                return Ok(());
            }
            Ok(other) => {
                return Err(protocol_error(format!(
                    "unexpected frame {} mid-stream",
                    frame_name(&other)
                )));
            }
            Err(e) if e.is_disconnect() => {
                tracing::debug!(session = %info.id, "producer disconnected");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }
}

fn protocol_error(msg: String) -> DialoutError {
    DialoutError::Transport(std::io::Error::new(std::io::ErrorKind::InvalidData, msg))
}

fn frame_name(frame: &Frame) -> &'static str {
    match frame {
        Frame::Hello { .. } => "hello",
        Frame::HelloAck => "hello-ack",
        Frame::AuthReject { .. } => "auth-reject",
        Frame::Batch(_) => "batch",
        Frame::Goodbye => "goodbye",
    }
}
