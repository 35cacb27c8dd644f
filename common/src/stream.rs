//! Framed duplex stream carrying one dial-out session.
//!
//! Wraps a TCP socket either bare (insecure posture) or behind a
//! synchronous rustls [`Connection`] driven by hand. Frames are bincode
//! payloads behind a little-endian `u32` length prefix, capped at 1 MiB.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};

use rustls::{ClientConnection, Connection, ServerConnection};

use crate::error::{DialoutError, Result};
use crate::message::Frame;

/// Upper bound on a single encoded frame.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// One duplex session transport: plain TCP or TLS over TCP.
#[derive(Debug)]
pub enum DialoutStream {
    Plain(TcpStream),
    Tls { socket: TcpStream, tls: Connection },
}

impl DialoutStream {
    /// Wrap a socket without transport encryption.
    pub fn plain(socket: TcpStream) -> Self {
        DialoutStream::Plain(socket)
    }

    /// Wrap the collector side of a connection and complete the TLS
    /// handshake before returning.
    pub fn from_server(socket: TcpStream, tls: ServerConnection) -> Result<Self> {
        let mut stream = DialoutStream::Tls {
            socket,
            tls: Connection::Server(tls),
        };
        stream.complete_handshake()?;
        Ok(stream)
    }

    /// Wrap the producer side of a connection and complete the TLS
    /// handshake before returning.
    pub fn from_client(socket: TcpStream, tls: ClientConnection) -> Result<Self> {
        let mut stream = DialoutStream::Tls {
            socket,
            tls: Connection::Client(tls),
        };
        stream.complete_handshake()?;
        Ok(stream)
    }

    fn complete_handshake(&mut self) -> Result<()> {
        let DialoutStream::Tls { socket, tls } = self else {
            return Ok(());
        };
        while tls.is_handshaking() {
            if tls.wants_write() {
                tls.write_tls(socket).map_err(DialoutError::Transport)?;
            }
            if tls.is_handshaking() && tls.wants_read() {
                if tls.read_tls(socket).map_err(DialoutError::Transport)? == 0 {
                    return Err(DialoutError::Transport(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed during TLS handshake",
                    )));
                }
                tls.process_new_packets()
                    .map_err(|e| DialoutError::Transport(invalid_data(e)))?;
            }
        }
        // Flush any handshake bytes still queued (e.g. session tickets).
        while tls.wants_write() {
            tls.write_tls(socket).map_err(DialoutError::Transport)?;
        }
        Ok(())
    }

    /// Send one frame and flush it to the socket.
    pub fn send_frame(&mut self, frame: &Frame) -> Result<()> {
        let payload = bincode::serialize(frame)
            .map_err(|e| DialoutError::Transport(invalid_data(e)))?;
        if payload.len() > MAX_FRAME_BYTES {
            return Err(DialoutError::Transport(invalid_data(format!(
                "frame too large: {} bytes",
                payload.len()
            ))));
        }

        let len = payload.len() as u32;
        self.write_all(&len.to_le_bytes())
            .map_err(DialoutError::Transport)?;
        self.write_all(&payload).map_err(DialoutError::Transport)?;
        self.flush().map_err(DialoutError::Transport)?;
        Ok(())
    }

    /// Receive one frame, blocking until it is complete.
    pub fn recv_frame(&mut self) -> Result<Frame> {
        let mut len_buf = [0u8; 4];
        self.read_exact(&mut len_buf).map_err(DialoutError::Transport)?;
        let len = u32::from_le_bytes(len_buf) as usize;

        if len > MAX_FRAME_BYTES {
            return Err(DialoutError::Transport(invalid_data(format!(
                "frame too large: {len} bytes"
            ))));
        }

        let mut payload = vec![0u8; len];
        self.read_exact(&mut payload).map_err(DialoutError::Transport)?;

        bincode::deserialize(&payload).map_err(|e| DialoutError::Transport(invalid_data(e)))
    }

    /// Graceful teardown: TLS close_notify when applicable, then a full
    /// socket shutdown. Errors here are expected on already-dead peers
    /// and are only logged.
    pub fn close(&mut self) {
        if let DialoutStream::Tls { socket, tls } = self {
            tls.send_close_notify();
            if let Err(e) = tls.write_tls(socket) {
                tracing::debug!(error = %e, "failed to flush close_notify");
            }
        }
        if let Err(e) = self.socket().shutdown(Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                tracing::debug!(error = %e, "socket shutdown failed");
            }
        }
    }

    fn socket(&self) -> &TcpStream {
        match self {
            DialoutStream::Plain(socket) => socket,
            DialoutStream::Tls { socket, .. } => socket,
        }
    }
}

fn invalid_data<E>(e: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::InvalidData, e)
}

impl Read for DialoutStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            DialoutStream::Plain(socket) => socket.read(buf),
            DialoutStream::Tls { socket, tls } => loop {
                // Drain buffered plaintext first.
                match tls.reader().read(buf) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e),
                }

                if !tls.wants_read() {
                    return Ok(0);
                }

                match tls.read_tls(socket)? {
                    0 => return Ok(0), // peer went away
                    _ => {
                        tls.process_new_packets().map_err(invalid_data)?;
                    }
                }
            },
        }
    }
}

impl Write for DialoutStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            DialoutStream::Plain(socket) => socket.write(buf),
            DialoutStream::Tls { socket, tls } => {
                let written = tls.writer().write(buf)?;
                while tls.wants_write() {
                    if let Err(e) = tls.write_tls(socket) {
                        if e.kind() != io::ErrorKind::WouldBlock {
                            return Err(e);
                        }
                        break;
                    }
                }
                Ok(written)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            DialoutStream::Plain(socket) => socket.flush(),
            DialoutStream::Tls { socket, tls } => {
                tls.writer().flush()?;
                while tls.wants_write() {
                    match tls.write_tls(socket) {
                        Ok(_) => {}
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => return Err(e),
                    }
                }
                socket.flush()
            }
        }
    }
}
