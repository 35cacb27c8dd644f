//! TLS configurator for both roles of the dial-out transport.
//!
//! Given the declared security options, builds a ready-to-use rustls
//! config (or `None` for the insecure posture), failing with
//! [`DialoutError::Configuration`] when a required file is missing or
//! unparseable, or when the field combination does not match the declared
//! mode. All validation happens here, at construction time; nothing is
//! loaded lazily during streaming.

use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};

use crate::config::{ClientOptions, ServerOptions};
use crate::error::{DialoutError, Result};

fn configuration<S: Into<String>>(msg: S) -> DialoutError {
    DialoutError::Configuration(msg.into())
}

/// Ensure a crypto provider is installed. Safe to call more than once.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = fs::read(path)
        .map_err(|e| configuration(format!("failed to read certificate {path:?}: {e}")))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(&*pem))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| configuration(format!("failed to parse certificate {path:?}: {e}")))?;
    if certs.is_empty() {
        return Err(configuration(format!("no certificates found in {path:?}")));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = fs::read(path)
        .map_err(|e| configuration(format!("failed to read private key {path:?}: {e}")))?;
    rustls_pemfile::private_key(&mut BufReader::new(&*pem))
        .map_err(|e| configuration(format!("failed to parse private key {path:?}: {e}")))?
        .ok_or_else(|| configuration(format!("no private key found in {path:?}")))
}

fn load_root_store(path: &Path) -> Result<RootCertStore> {
    let mut store = RootCertStore::empty();
    store.add_parsable_certificates(load_certs(path)?);
    if store.is_empty() {
        return Err(configuration(format!(
            "no valid CA certificates found in {path:?}"
        )));
    }
    Ok(store)
}

fn reject_cert_material(
    role: &str,
    ca: &Option<std::path::PathBuf>,
    cert: &Option<std::path::PathBuf>,
    key: &Option<std::path::PathBuf>,
) -> Result<()> {
    if ca.is_some() || cert.is_some() || key.is_some() {
        return Err(configuration(format!(
            "{role}: insecure mode does not take certificate files"
        )));
    }
    Ok(())
}

/// Build the collector-side TLS config, or `None` for plain TCP.
///
/// Postures: `insecure` carries no certificate material at all;
/// `skip_verify` presents the server certificate without requesting
/// client certificates; the default is mutual TLS with client
/// certificates validated against `ca_file`.
pub fn server_tls_config(opts: &ServerOptions) -> Result<Option<Arc<ServerConfig>>> {
    if opts.insecure {
        if opts.skip_verify {
            return Err(configuration(
                "server: insecure and skip-verify are mutually exclusive",
            ));
        }
        reject_cert_material("server", &opts.ca_file, &opts.cert_file, &opts.key_file)?;
        return Ok(None);
    }

    // Field-combination checks come before any file access.
    let cert_file = opts
        .cert_file
        .as_deref()
        .ok_or_else(|| configuration("server: cert_file is required unless insecure"))?;
    let key_file = opts
        .key_file
        .as_deref()
        .ok_or_else(|| configuration("server: key_file is required unless insecure"))?;
    if !opts.skip_verify && opts.ca_file.is_none() {
        return Err(configuration("server: ca_file is required for mutual TLS"));
    }

    install_crypto_provider();

    let cert_chain = load_certs(cert_file)?;
    let private_key = load_private_key(key_file)?;

    let builder = if opts.skip_verify {
        if let Some(ca) = &opts.ca_file {
            tracing::debug!(ca = ?ca, "skip-verify server ignores ca_file");
        }
        ServerConfig::builder().with_no_client_auth()
    } else {
        // Presence checked above.
        let ca_file = opts
            .ca_file
            .as_deref()
            .ok_or_else(|| configuration("server: ca_file is required for mutual TLS"))?;
        let roots = load_root_store(ca_file)?;
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| configuration(format!("failed to build client verifier: {e}")))?;
        ServerConfig::builder().with_client_cert_verifier(verifier)
    };

    let config = builder
        .with_single_cert(cert_chain, private_key)
        .map_err(|e| configuration(format!("invalid server certificate/key pair: {e}")))?;

    Ok(Some(Arc::new(config)))
}

/// Build the producer-side TLS config, or `None` for plain TCP.
///
/// `skip_verify` encrypts the channel but accepts any server certificate;
/// otherwise the server certificate is validated against `ca_file` and
/// the configured `server_name`. A client certificate/key pair, when
/// present, is offered for mutual TLS.
pub fn client_tls_config(opts: &ClientOptions) -> Result<Option<Arc<ClientConfig>>> {
    if opts.insecure {
        if opts.skip_verify {
            return Err(configuration(
                "client: insecure and skip-verify are mutually exclusive",
            ));
        }
        reject_cert_material("client", &opts.ca_file, &opts.cert_file, &opts.key_file)?;
        return Ok(None);
    }

    // Field-combination checks come before any file access.
    if matches!(
        (&opts.cert_file, &opts.key_file),
        (Some(_), None) | (None, Some(_))
    ) {
        return Err(configuration(
            "client: cert_file and key_file must be given together",
        ));
    }
    if !opts.skip_verify {
        if opts.ca_file.is_none() {
            return Err(configuration(
                "client: ca_file is required unless skipping verification",
            ));
        }
        if opts.server_name.is_none() {
            return Err(configuration(
                "client: server_name is required unless skipping verification",
            ));
        }
    }

    install_crypto_provider();

    let client_auth = match (&opts.cert_file, &opts.key_file) {
        (Some(cert), Some(key)) => Some((load_certs(cert)?, load_private_key(key)?)),
        _ => None,
    };

    let builder = if opts.skip_verify {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertificateVerification))
    } else {
        // Presence checked above.
        let ca_file = opts
            .ca_file
            .as_deref()
            .ok_or_else(|| configuration("client: ca_file is required"))?;
        ClientConfig::builder().with_root_certificates(load_root_store(ca_file)?)
    };

    let config = match client_auth {
        Some((chain, key)) => builder
            .with_client_auth_cert(chain, key)
            .map_err(|e| configuration(format!("invalid client certificate/key pair: {e}")))?,
        None => builder.with_no_client_auth(),
    };

    Ok(Some(Arc::new(config)))
}

/// SNI/identity to present on connect. Falls back to the host part of the
/// dial address when no server name is configured (skip-verify mode).
pub fn client_server_name(opts: &ClientOptions, address: &str) -> Result<ServerName<'static>> {
    let name = match &opts.server_name {
        Some(name) => name.clone(),
        None => host_part(address).to_string(),
    };
    ServerName::try_from(name.clone())
        .map_err(|_| configuration(format!("invalid server name {name:?}")))
}

fn host_part(address: &str) -> &str {
    let host = address
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(address);
    host.trim_start_matches('[').trim_end_matches(']')
}

/// Accepts any server certificate. Used only for the skip-verify posture,
/// which encrypts the channel without authenticating the peer.
#[derive(Debug)]
struct NoCertificateVerification;

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
