//! Merged per-address probe results.

use std::collections::BTreeSet;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use rustls::pki_types::CertificateDer;
use sha1::{Digest, Sha1};

use crate::certs::{CertificateValidity, TrustedRoots};

use super::error::simplify_probe_error;
use super::grab::{HostGrab, KeyExchange};

/// Everything the scanner learned about one mail exchanger address, merged
/// from one or more [`HostGrab`]s.
///
/// Merge rules: the version and cipher sets accumulate across grabs; the
/// certificate chain, STARTTLS flag, key exchange and error come from the
/// first grab only.
pub struct MxHostSummary {
    address: IpAddr,
    updated: DateTime<Utc>,
    starttls: Option<bool>,
    tls_versions: BTreeSet<u16>,
    cipher_suites: BTreeSet<u16>,
    chain: Vec<CertificateDer<'static>>,
    fingerprints: Vec<[u8; 20]>,
    validity: Option<CertificateValidity>,
    ecdhe: Option<String>,
    error: Option<String>,
}

impl MxHostSummary {
    pub(crate) fn new(address: IpAddr) -> Self {
        Self {
            address,
            updated: Utc::now(),
            starttls: None,
            tls_versions: BTreeSet::new(),
            cipher_suites: BTreeSet::new(),
            chain: Vec::new(),
            fingerprints: Vec::new(),
            validity: None,
            ecdhe: None,
            error: None,
        }
    }

    /// Records the outcome of the first grab: STARTTLS flag and the first
    /// error, simplified for grouping.
    pub(crate) fn record_first(&mut self, grab: &HostGrab) {
        self.starttls = grab.starttls;
        self.error = grab.error.as_deref().map(simplify_probe_error);
    }

    /// Merges a successful grab into the summary.
    pub(crate) fn append(&mut self, grab: HostGrab) {
        if self.chain.is_empty() {
            self.chain = grab.chain;
        }

        if let Some(version) = grab.tls_version {
            self.tls_versions.insert(version);
            if let Some(suite) = grab.cipher_suite {
                self.cipher_suites.insert(suite);
            }
            if self.ecdhe.is_none() {
                if let KeyExchange::Ecdhe { name, .. } = &grab.key_exchange {
                    self.ecdhe = Some(name.clone());
                }
            }
        }
    }

    /// Computes fingerprints and the chain verdict once all grabs are
    /// merged.
    pub(crate) fn finalize(&mut self, roots: &TrustedRoots) {
        if self.chain.is_empty() {
            return;
        }
        self.fingerprints = self
            .chain
            .iter()
            .map(|der| Sha1::digest(der.as_ref()).into())
            .collect();
        self.validity = Some(CertificateValidity::new(&self.chain, roots));
    }

    /// The probed address.
    pub fn address(&self) -> IpAddr {
        self.address
    }

    /// When this summary was produced.
    pub fn updated(&self) -> DateTime<Utc> {
        self.updated
    }

    /// Whether the server accepted STARTTLS (`None`: never got that far).
    pub fn starttls(&self) -> Option<bool> {
        self.starttls
    }

    /// Protocol version codes seen across grabs.
    pub fn tls_versions(&self) -> &BTreeSet<u16> {
        &self.tls_versions
    }

    /// Cipher suite codes seen across grabs.
    pub fn cipher_suites(&self) -> &BTreeSet<u16> {
        &self.cipher_suites
    }

    /// The certificate chain of the first successful handshake.
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    /// SHA-1 digests of the chain, server certificate first.
    pub fn fingerprints(&self) -> &[[u8; 20]] {
        &self.fingerprints
    }

    /// The server certificate's fingerprint.
    pub fn server_fingerprint(&self) -> Option<&[u8; 20]> {
        self.fingerprints.first()
    }

    /// Fingerprints of the CA certificates, in chain order.
    pub fn ca_fingerprints(&self) -> &[[u8; 20]] {
        if self.fingerprints.is_empty() {
            &[]
        } else {
            &self.fingerprints[1..]
        }
    }

    /// The chain verdict, when a chain was captured.
    pub fn validity(&self) -> Option<&CertificateValidity> {
        self.validity.as_ref()
    }

    /// Whether the server certificate is outside its validity window.
    pub fn certificate_expired(&self) -> Option<bool> {
        self.validity.as_ref().map(CertificateValidity::expired)
    }

    /// The curve of the first ECDHE key exchange, if any.
    pub fn ecdhe(&self) -> Option<&str> {
        self.ecdhe.as_deref()
    }

    /// The first error encountered, simplified.
    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }
}
