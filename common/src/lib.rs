//! Shared pieces of the gNMI dial-out transport.
//!
//! This crate carries everything both roles need to agree on:
//!
//! - Telemetry message and wire-frame definitions
//! - The framed stream wrapper (plain TCP or synchronous rustls)
//! - The TLS configurator for the three security postures
//! - Role option structs and the transport error type

/// Role options and in-band credentials
pub mod config;

/// The transport error type
pub mod error;

/// Telemetry messages and wire frames
pub mod message;

/// Framed duplex stream over TCP or TLS
pub mod stream;

/// TLS configurator for both roles
pub mod tls;

// Re-export commonly used types for convenience
pub use config::{ClientOptions, Credentials, ServerOptions};
pub use error::{DialoutError, Result};
pub use message::{Batch, Frame, Notification, Path, PathElem, TelemetryMessage, TypedValue, Update};
pub use stream::DialoutStream;
