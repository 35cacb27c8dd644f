use std::path::PathBuf;

/// Username/password pair checked in-band at session start, layered above
/// whatever transport security is configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new<U: Into<String>, P: Into<String>>(username: U, password: P) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Security and authentication options for the collector role.
///
/// The three transport postures are mutually exclusive: `insecure` plain
/// TCP, `skip_verify` TLS (the server presents its certificate, clients
/// are not certificate-checked), and full mutual TLS (the default when
/// neither flag is set, requiring `ca_file`, `cert_file`, and `key_file`).
/// Credentials are required from every session iff both `username` and
/// `password` are set.
#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    pub insecure: bool,
    pub skip_verify: bool,
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ServerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Disable transport encryption entirely.
    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// Present a certificate but do not require client certificates.
    pub fn with_skip_verify(mut self, skip_verify: bool) -> Self {
        self.skip_verify = skip_verify;
        self
    }

    pub fn with_ca_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.ca_file = Some(path.into());
        self
    }

    pub fn with_cert_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.cert_file = Some(path.into());
        self
    }

    pub fn with_key_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.key_file = Some(path.into());
        self
    }

    /// Require this username/password pair from every session.
    pub fn with_credentials<U: Into<String>, P: Into<String>>(
        mut self,
        username: U,
        password: P,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// The credentials sessions must present, if any.
    pub fn required_credentials(&self) -> Option<Credentials> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => Some(Credentials::new(u.clone(), p.clone())),
            _ => None,
        }
    }
}

/// Security and authentication options for the producer role.
///
/// Mirrors [`ServerOptions`] plus `server_name`, the identity expected in
/// the collector's certificate when verification is not skipped.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub insecure: bool,
    pub skip_verify: bool,
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub server_name: Option<String>,
}

impl ClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// Encrypt the channel but accept any server certificate.
    pub fn with_skip_verify(mut self, skip_verify: bool) -> Self {
        self.skip_verify = skip_verify;
        self
    }

    pub fn with_ca_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.ca_file = Some(path.into());
        self
    }

    pub fn with_cert_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.cert_file = Some(path.into());
        self
    }

    pub fn with_key_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.key_file = Some(path.into());
        self
    }

    pub fn with_credentials<U: Into<String>, P: Into<String>>(
        mut self,
        username: U,
        password: P,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Expected identity of the collector's certificate.
    pub fn with_server_name<S: Into<String>>(mut self, name: S) -> Self {
        self.server_name = Some(name.into());
        self
    }
}
