//! gNMI dial-out producer.
//!
//! A [`DialoutClient`] opens exactly one outbound session to a collector,
//! completes the TLS and credential handshake at construction, and then
//! streams ordered batches of telemetry messages with a blocking
//! [`send`](DialoutClient::send) until [`close`](DialoutClient::close).
//!
//! ```no_run
//! use dialout_client::DialoutClient;
//! use dialout_common::{ClientOptions, TelemetryMessage};
//!
//! let opts = ClientOptions::new()
//!     .with_skip_verify(true)
//!     .with_credentials("myaccount", "mypassword");
//!
//! let mut client = DialoutClient::new("collector.example:8088", opts)?;
//! client.send(&[TelemetryMessage::SyncMarker])?;
//! client.close()?;
//! # Ok::<(), dialout_common::DialoutError>(())
//! ```

use std::io;
use std::net::TcpStream;
use std::time::SystemTime;

use dialout_common::{tls, ClientOptions, DialoutError, DialoutStream, Frame, Result, TelemetryMessage};
use rustls::ClientConnection;
use uuid::Uuid;

/// The producer's view of its single session.
#[derive(Debug, Clone)]
pub struct ClientSession {
    pub id: Uuid,
    /// Whether the collector's certificate identity was verified.
    pub peer_authenticated: bool,
    pub opened_at: SystemTime,
}

/// The producer endpoint of the dial-out transport.
///
/// Owns its one session. Intended for single-owner sequential use; the
/// `&mut self` operations make concurrent sends a compile error rather
/// than undefined interleaving.
#[derive(Debug)]
pub struct DialoutClient {
    stream: Option<DialoutStream>,
    session: ClientSession,
}

impl DialoutClient {
    /// Validate the security options, dial the collector, complete the
    /// TLS handshake for the configured posture, and present credentials.
    ///
    /// Fails with [`DialoutError::Configuration`] on an invalid option
    /// combination, [`DialoutError::Transport`] if the connect or
    /// handshake fails, and [`DialoutError::Authentication`] if the
    /// collector rejects the credentials. No partially-open client is
    /// ever returned.
    pub fn new(address: &str, options: ClientOptions) -> Result<Self> {
        let tls_config = tls::client_tls_config(&options)?;
        let peer_authenticated = tls_config.is_some() && !options.skip_verify;

        let socket = TcpStream::connect(address)?;
        if let Err(e) = socket.set_nodelay(true) {
            tracing::debug!(error = %e, "failed to set TCP_NODELAY");
        }

        let mut stream = match tls_config {
            Some(config) => {
                let server_name = tls::client_server_name(&options, address)?;
                let conn = ClientConnection::new(config, server_name)?;
                DialoutStream::from_client(socket, conn)?
            }
            None => DialoutStream::plain(socket),
        };

        stream.send_frame(&Frame::Hello {
            username: options.username.clone(),
            password: options.password.clone(),
        })?;

        match stream.recv_frame()? {
            Frame::HelloAck => {}
            Frame::AuthReject { reason } => {
                stream.close();
                return Err(DialoutError::Authentication(reason));
            }
            other => {
                stream.close();
                return Err(DialoutError::Transport(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unexpected frame at session start: {other:?}"),
                )));
            }
        }

        let session = ClientSession {
            id: Uuid::new_v4(),
            peer_authenticated,
            opened_at: SystemTime::now(),
        };
        tracing::info!(session = %session.id, collector = address, "session opened");

        Ok(Self {
            stream: Some(stream),
            session,
        })
    }

    /// Transmit the batch's messages, in order, over the session. Returns
    /// once the transport accepted the write; this is a local
    /// acknowledgment, not an end-to-end delivery guarantee. An empty
    /// batch is a successful no-op.
    pub fn send(&mut self, batch: &[TelemetryMessage]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(DialoutError::Closed)?;
        if batch.is_empty() {
            tracing::trace!(session = %self.session.id, "empty batch skipped");
            return Ok(());
        }

        tracing::debug!(session = %self.session.id, messages = batch.len(), "sending batch");
        stream.send_frame(&Frame::Batch(batch.to_vec()))
    }

    /// Graceful half-close of the stream followed by full teardown.
    /// Idempotent; also runs on drop.
    pub fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.send_frame(&Frame::Goodbye) {
                tracing::debug!(session = %self.session.id, error = %e, "goodbye not delivered");
            }
            stream.close();
            tracing::info!(session = %self.session.id, "session closed");
        }
        Ok(())
    }

    /// Whether the session has been closed.
    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// The client's session identity.
    pub fn session(&self) -> &ClientSession {
        &self.session
    }
}

impl Drop for DialoutClient {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
