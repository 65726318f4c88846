//! System trust store loading.

use log::{debug, info};
use rustls::pki_types::CertificateDer;
use x509_parser::prelude::parse_x509_certificate;

use crate::error_handling::InitializationError;

/// The root certificates chains are validated against.
///
/// Subjects are extracted once at load time so that issuer matching during
/// chain building only parses the few roots whose subject actually matches.
pub struct TrustedRoots {
    certs: Vec<CertificateDer<'static>>,
    subjects: Vec<Vec<u8>>,
}

impl TrustedRoots {
    /// Loads the platform trust store (the "system" root store).
    ///
    /// # Errors
    ///
    /// Returns [`InitializationError::TrustStoreError`] when the platform
    /// store cannot be read or contains no usable certificates.
    pub fn load_system() -> Result<Self, InitializationError> {
        let certs = rustls_native_certs::load_native_certs()
            .map_err(|e| InitializationError::TrustStoreError(e.to_string()))?;

        let roots = Self::from_der(certs);
        if roots.is_empty() {
            return Err(InitializationError::TrustStoreError(
                "system trust store contains no parsable certificates".to_string(),
            ));
        }

        info!("Loaded {} trusted root certificates", roots.len());
        Ok(roots)
    }

    /// Builds a store from DER certificates, skipping unparsable entries.
    pub fn from_der(certs: Vec<CertificateDer<'static>>) -> Self {
        let mut kept = Vec::with_capacity(certs.len());
        let mut subjects = Vec::with_capacity(certs.len());

        for der in certs {
            match parse_x509_certificate(der.as_ref()) {
                Ok((_, cert)) => {
                    subjects.push(cert.subject().as_raw().to_vec());
                    kept.push(der);
                }
                Err(err) => debug!("Skipping unparsable root certificate: {err}"),
            }
        }

        Self {
            certs: kept,
            subjects,
        }
    }

    /// Roots whose subject equals `issuer` (raw DER name comparison).
    pub(crate) fn find_issuers<'a>(
        &'a self,
        issuer: &'a [u8],
    ) -> impl Iterator<Item = &'a CertificateDer<'static>> {
        self.subjects
            .iter()
            .zip(&self.certs)
            .filter(move |(subject, _)| subject.as_slice() == issuer)
            .map(|(_, der)| der)
    }

    /// Whether `der` is byte-identical to one of the roots.
    pub(crate) fn contains(&self, der: &CertificateDer<'_>) -> bool {
        self.certs.iter().any(|root| root.as_ref() == der.as_ref())
    }

    /// Number of usable roots.
    pub fn len(&self) -> usize {
        self.certs.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }
}
