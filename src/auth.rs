//! Certificate-identity whitelisting for the RPC server.
//!
//! Each role (read, write) is configured by a directory of DER-encoded
//! certificates; a certificate's DER bytes stand in for its subject, since
//! nothing here needs to parse X.509 fields out of it — byte-identity with
//! a configured certificate is the entire authorization decision.

use std::collections::HashSet;
use std::path::Path;

use crate::error::AuthError;

/// One role's whitelist: the set of acceptable client certificates, by
/// their full DER bytes.
#[derive(Debug, Clone, Default)]
pub struct CertSet {
    certs: HashSet<Vec<u8>>,
}

impl CertSet {
    pub fn empty() -> Self {
        Self { certs: HashSet::new() }
    }

    /// Builds a whitelist directly from DER bytes, bypassing directory
    /// loading. Used by tests elsewhere in the crate that need a populated
    /// [`AuthConfig`] without writing certificate files to disk.
    pub(crate) fn from_certs(certs: impl IntoIterator<Item = Vec<u8>>) -> Self {
        Self { certs: certs.into_iter().collect() }
    }

    /// Loads every `*.der` / `*.crt` / `*.pem` file in `dir` as a whitelisted
    /// certificate. A missing directory yields an empty set (the role is
    /// then unrestricted, per the "empty set ⇒ allow" rule).
    pub fn load_dir(dir: &Path) -> std::io::Result<Self> {
        let mut certs = HashSet::new();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self { certs }),
            Err(e) => return Err(e),
        };

        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let bytes = std::fs::read(entry.path())?;
            certs.insert(der_bytes(&bytes));
        }
        Ok(Self { certs })
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    pub fn contains(&self, cert_der: &[u8]) -> bool {
        self.certs.contains(cert_der)
    }

    fn merge(&mut self, other: &CertSet) {
        self.certs.extend(other.certs.iter().cloned());
    }
}

/// The two role sets, with the write-role implicitly merged into the
/// read-role once at construction (anyone who may write may also read).
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    readable: CertSet,
    writable: CertSet,
}

impl AuthConfig {
    pub fn new(mut readable: CertSet, writable: CertSet) -> Self {
        readable.merge(&writable);
        Self { readable, writable }
    }

    pub fn from_dirs(
        readonly_certs_dir: Option<&Path>,
        writable_certs_dir: Option<&Path>,
    ) -> std::io::Result<Self> {
        let readable = match readonly_certs_dir {
            Some(dir) => CertSet::load_dir(dir)?,
            None => CertSet::empty(),
        };
        let writable = match writable_certs_dir {
            Some(dir) => CertSet::load_dir(dir)?,
            None => CertSet::empty(),
        };
        Ok(Self::new(readable, writable))
    }

    /// Checks `peer_cert` (the client's DER-encoded leaf certificate, if
    /// TLS mutual auth is in effect) against the read role's whitelist. An
    /// empty whitelist allows every caller, matching rule 1 of the
    /// specification's authorization algorithm. No certificate presented
    /// against a nonempty whitelist is `Unauthenticated`; a certificate
    /// presented but absent from the whitelist is `PermissionDenied`.
    pub fn check_read(&self, peer_cert: Option<&[u8]>) -> Result<(), AuthError> {
        check(&self.readable, peer_cert)
    }

    pub fn check_write(&self, peer_cert: Option<&[u8]>) -> Result<(), AuthError> {
        check(&self.writable, peer_cert)
    }
}

fn check(set: &CertSet, peer_cert: Option<&[u8]>) -> Result<(), AuthError> {
    if set.is_empty() {
        return Ok(());
    }
    let Some(cert) = peer_cert else {
        return Err(AuthError::Unauthenticated);
    };
    if set.contains(cert) {
        Ok(())
    } else {
        Err(AuthError::PermissionDenied)
    }
}

/// PEM-wrapped certificates are accepted alongside raw DER for operator
/// convenience; everything is normalized to DER bytes before comparison.
fn der_bytes(file_contents: &[u8]) -> Vec<u8> {
    if let Ok(text) = std::str::from_utf8(file_contents) {
        if text.contains("-----BEGIN CERTIFICATE-----") {
            let mut reader = std::io::Cursor::new(file_contents);
            if let Some(Ok(cert)) = rustls_pemfile::certs(&mut reader).next() {
                return cert.to_vec();
            }
        }
    }
    file_contents.to_vec()
}
