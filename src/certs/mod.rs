//! Certificate chain validation.
//!
//! Judges the certificate chain a mail server presented: expiry of the
//! server certificate, unhandled critical extensions, and whether a chain
//! can be built from the server certificate through the presented
//! intermediates to a trusted root with the server-authentication key usage.
//!
//! Chains are validated against named root stores; only the platform store
//! ("system") is populated today, but the result keeps its map shape so
//! further stores can be added.

mod roots;

pub use roots::TrustedRoots;

use std::collections::{BTreeSet, HashMap};

use rustls::pki_types::CertificateDer;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::ParsedExtension;
use x509_parser::prelude::parse_x509_certificate;

/// Name of the platform trust store.
pub const SYSTEM_STORE: &str = "system";

/// Chains longer than this are not considered.
const MAX_CHAIN_DEPTH: usize = 8;

/// The verdict on one presented certificate chain.
pub struct CertificateValidity {
    expired: bool,
    error: Option<String>,
    trusted_chains: HashMap<String, Vec<CertificateDer<'static>>>,
}

impl CertificateValidity {
    /// Validates `presented` (server certificate first, then any
    /// intermediates) against `roots`.
    pub fn new(presented: &[CertificateDer<'static>], roots: &TrustedRoots) -> Self {
        let mut validity = Self {
            expired: false,
            error: None,
            trusted_chains: HashMap::new(),
        };

        let Some(leaf_der) = presented.first() else {
            validity.error = Some("no certificates presented".to_string());
            return validity;
        };

        let leaf = match parse_x509_certificate(leaf_der.as_ref()) {
            Ok((_, leaf)) => leaf,
            Err(err) => {
                validity.error = Some(format!("unparsable server certificate: {err}"));
                return validity;
            }
        };

        validity.expired = !leaf.validity().is_valid();

        // A critical extension the parser does not understand must stop
        // validation: ignoring it could silently widen the certificate's
        // meaning.
        if has_unhandled_critical_extension(&leaf) {
            validity.error = Some("unhandled critical extension".to_string());
            return validity;
        }

        match build_chain(leaf_der, &leaf, &presented[1..], roots) {
            Some(chain) => {
                if leaf_allows_server_auth(&leaf) {
                    validity
                        .trusted_chains
                        .insert(SYSTEM_STORE.to_string(), chain);
                } else {
                    validity.error =
                        Some("certificate specifies an incompatible key usage".to_string());
                }
            }
            None => {
                validity.error = Some(if validity.expired {
                    "certificate has expired or is not yet valid".to_string()
                } else {
                    "certificate signed by unknown authority".to_string()
                });
            }
        }

        validity
    }

    /// Whether the current time is outside the server certificate's
    /// validity window.
    pub fn expired(&self) -> bool {
        self.expired
    }

    /// The validation error, or `None` when a trusted chain was found.
    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Names of the root stores a trusted chain was found in.
    pub fn trusted_names(&self) -> BTreeSet<&str> {
        self.trusted_chains.keys().map(String::as_str).collect()
    }

    /// The chain found in the system store (server certificate first, root
    /// last), if any.
    pub fn system_chain(&self) -> Option<&[CertificateDer<'static>]> {
        self.trusted_chains.get(SYSTEM_STORE).map(Vec::as_slice)
    }

    /// The root certificate of the first trusted chain.
    pub fn root_certificate(&self) -> Option<&CertificateDer<'static>> {
        self.trusted_chains.values().next().and_then(|c| c.last())
    }

    /// The intermediate certificates of the first trusted chain, or an
    /// empty slice when the chain has fewer than three elements.
    pub fn intermediate_certificates(&self) -> &[CertificateDer<'static>] {
        match self.trusted_chains.values().next() {
            Some(chain) if chain.len() >= 3 => &chain[1..chain.len() - 1],
            _ => &[],
        }
    }
}

/// Walks from the leaf to a trusted root, admitting presented
/// intermediates, verifying signatures and validity windows along the way.
/// Returns the first chain found, leaf first.
fn build_chain(
    leaf_der: &CertificateDer<'static>,
    leaf: &X509Certificate<'_>,
    intermediates: &[CertificateDer<'static>],
    roots: &TrustedRoots,
) -> Option<Vec<CertificateDer<'static>>> {
    if !leaf.validity().is_valid() {
        return None;
    }

    // A server certificate that is itself a trusted root forms a chain of
    // one.
    if roots.contains(leaf_der) {
        return Some(vec![leaf_der.clone()]);
    }

    let parsed: Vec<Option<X509Certificate<'_>>> = intermediates
        .iter()
        .map(|der| parse_x509_certificate(der.as_ref()).ok().map(|(_, c)| c))
        .collect();

    let mut used = Vec::new();
    let links = extend_chain(leaf, &parsed, roots, &mut used, 0)?;

    let mut chain = Vec::with_capacity(links.len() + 1);
    chain.push(leaf_der.clone());
    for link in links {
        match link {
            Link::Presented(i) => chain.push(intermediates[i].clone()),
            Link::Root(der) => chain.push(der),
        }
    }
    Some(chain)
}

enum Link {
    Presented(usize),
    Root(CertificateDer<'static>),
}

fn extend_chain(
    current: &X509Certificate<'_>,
    presented: &[Option<X509Certificate<'_>>],
    roots: &TrustedRoots,
    used: &mut Vec<usize>,
    depth: usize,
) -> Option<Vec<Link>> {
    if depth > MAX_CHAIN_DEPTH {
        return None;
    }

    // Prefer completing at a root over descending further, so the shortest
    // chain wins.
    if let Some(root) = issuing_root(current, roots) {
        return Some(vec![Link::Root(root)]);
    }

    let issuer = current.issuer().as_raw();
    for (i, candidate) in presented.iter().enumerate() {
        let Some(candidate) = candidate else { continue };
        if used.contains(&i) {
            continue;
        }
        if candidate.subject().as_raw() != issuer {
            continue;
        }
        if !candidate.validity().is_valid() {
            continue;
        }
        if current.verify_signature(Some(candidate.public_key())).is_err() {
            continue;
        }

        used.push(i);
        if let Some(mut rest) = extend_chain(candidate, presented, roots, used, depth + 1) {
            used.pop();
            rest.insert(0, Link::Presented(i));
            return Some(rest);
        }
        used.pop();
    }

    None
}

/// A trusted root that issued `current`, if one exists.
fn issuing_root(
    current: &X509Certificate<'_>,
    roots: &TrustedRoots,
) -> Option<CertificateDer<'static>> {
    for root_der in roots.find_issuers(current.issuer().as_raw()) {
        if let Ok((_, root)) = parse_x509_certificate(root_der.as_ref()) {
            if root.validity().is_valid()
                && current.verify_signature(Some(root.public_key())).is_ok()
            {
                return Some(root_der.clone());
            }
        }
    }
    None
}

fn has_unhandled_critical_extension(cert: &X509Certificate<'_>) -> bool {
    cert.extensions().iter().any(|ext| {
        ext.critical
            && matches!(
                ext.parsed_extension(),
                ParsedExtension::UnsupportedExtension { .. }
            )
    })
}

/// Whether the leaf may be used for server authentication: either it
/// carries no extended-key-usage extension, or that extension names server
/// authentication (or any usage).
fn leaf_allows_server_auth(cert: &X509Certificate<'_>) -> bool {
    match cert.extended_key_usage() {
        Ok(Some(ext)) => ext.value.server_auth || ext.value.any,
        Ok(None) => true,
        Err(_) => false,
    }
}

/// Whether the certificate is marked as a CA via basic constraints.
pub(crate) fn is_ca(cert: &X509Certificate<'_>) -> bool {
    matches!(cert.basic_constraints(), Ok(Some(ext)) if ext.value.ca)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_der(byte: u8) -> CertificateDer<'static> {
        CertificateDer::from(vec![byte; 8])
    }

    fn validity_with_chain(chain: Vec<CertificateDer<'static>>) -> CertificateValidity {
        let mut trusted_chains = HashMap::new();
        trusted_chains.insert(SYSTEM_STORE.to_string(), chain);
        CertificateValidity {
            expired: false,
            error: None,
            trusted_chains,
        }
    }

    #[test]
    fn test_empty_presentation_is_an_error() {
        let roots = TrustedRoots::from_der(Vec::new());
        let validity = CertificateValidity::new(&[], &roots);
        assert!(validity.error_message().is_some());
        assert!(validity.trusted_names().is_empty());
    }

    #[test]
    fn test_garbage_leaf_is_an_error() {
        let roots = TrustedRoots::from_der(Vec::new());
        let validity = CertificateValidity::new(&[fake_der(0xaa)], &roots);
        assert!(validity
            .error_message()
            .is_some_and(|e| e.contains("unparsable")));
        assert!(validity.system_chain().is_none());
    }

    #[test]
    fn test_unparsable_roots_are_skipped() {
        let roots = TrustedRoots::from_der(vec![fake_der(1), fake_der(2)]);
        assert!(roots.is_empty());
    }

    #[test]
    fn test_trusted_names() {
        let validity = validity_with_chain(vec![fake_der(1), fake_der(2)]);
        let names = validity.trusted_names();
        assert_eq!(names.len(), 1);
        assert!(names.contains(SYSTEM_STORE));
    }

    #[test]
    fn test_root_certificate_is_last_in_chain() {
        let root = fake_der(3);
        let validity = validity_with_chain(vec![fake_der(1), fake_der(2), root.clone()]);
        assert_eq!(validity.root_certificate(), Some(&root));
    }

    #[test]
    fn test_intermediates_skip_leaf_and_root() {
        let intermediate = fake_der(2);
        let validity =
            validity_with_chain(vec![fake_der(1), intermediate.clone(), fake_der(3)]);
        assert_eq!(validity.intermediate_certificates(), &[intermediate]);
    }

    #[test]
    fn test_short_chain_has_no_intermediates() {
        let validity = validity_with_chain(vec![fake_der(1), fake_der(2)]);
        assert!(validity.intermediate_certificates().is_empty());

        let direct = validity_with_chain(vec![fake_der(1)]);
        assert!(direct.intermediate_certificates().is_empty());
    }
}
