//! The per-domain TXT summary record.

use std::fmt;
use std::sync::Arc;

use crate::probe::{tls_version_name, MxHostSummary};

/// The canonical one-line summary for a mail exchanger hostname: one
/// bracket group per address, in address discovery order.
///
/// Format:
/// `hostname [addr=IP status=ok|error=<text> starttls=yes|no tlsver=... cipher=... fpr=<hex>] ...`
pub struct TxtRecord {
    domain: String,
    hosts: Vec<Arc<MxHostSummary>>,
}

impl TxtRecord {
    pub(crate) fn new(domain: String, hosts: Vec<Arc<MxHostSummary>>) -> Self {
        Self { domain, hosts }
    }

    /// The hostname this record summarizes.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The per-address summaries, in discovery order.
    pub fn hosts(&self) -> &[Arc<MxHostSummary>] {
        &self.hosts
    }
}

impl fmt::Display for TxtRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.domain)?;
        for host in &self.hosts {
            write!(f, " [{}]", render_host(host))?;
        }
        Ok(())
    }
}

fn render_host(summary: &MxHostSummary) -> String {
    let mut fields = vec![format!("addr={}", summary.address())];

    match summary.error_message() {
        None => fields.push("status=ok".to_string()),
        Some(error) => fields.push(format!("error={error}")),
    }

    let starttls = if summary.starttls() == Some(true) {
        "yes"
    } else {
        "no"
    };
    fields.push(format!("starttls={starttls}"));

    if !summary.tls_versions().is_empty() {
        let versions: Vec<String> = summary
            .tls_versions()
            .iter()
            .map(|code| tls_version_name(*code))
            .collect();
        fields.push(format!("tlsver={}", versions.join(",")));
    }
    if !summary.cipher_suites().is_empty() {
        let ciphers: Vec<String> = summary
            .cipher_suites()
            .iter()
            .map(|code| format!("0x{code:04x}"))
            .collect();
        fields.push(format!("cipher={}", ciphers.join(",")));
    }
    if let Some(fingerprint) = summary.server_fingerprint() {
        fields.push(format!("fpr={}", hex::encode(fingerprint)));
    }

    fields.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs::TrustedRoots;
    use crate::probe::HostGrab;
    use rustls::pki_types::CertificateDer;
    use sha1::{Digest, Sha1};
    use std::net::IpAddr;

    fn summary_ok(address: &str, version: u16, cipher: u16) -> Arc<MxHostSummary> {
        let mut summary = MxHostSummary::new(address.parse::<IpAddr>().unwrap());
        let grab = HostGrab {
            starttls: Some(true),
            tls_version: Some(version),
            cipher_suite: Some(cipher),
            chain: vec![CertificateDer::from(vec![0x42; 16])],
            ..HostGrab::default()
        };
        summary.record_first(&grab);
        summary.append(grab);
        summary.finalize(&TrustedRoots::from_der(Vec::new()));
        Arc::new(summary)
    }

    fn summary_failed(address: &str, error: &str) -> Arc<MxHostSummary> {
        let mut summary = MxHostSummary::new(address.parse::<IpAddr>().unwrap());
        summary.record_first(&HostGrab {
            error: Some(error.to_string()),
            ..HostGrab::default()
        });
        Arc::new(summary)
    }

    #[test]
    fn test_render_preserves_discovery_order() {
        let record = TxtRecord::new(
            "mx.example.com".to_string(),
            vec![
                summary_ok("192.0.2.1", 0x0303, 0xc02f),
                summary_ok("192.0.2.2", 0x0301, 0x002f),
                summary_ok("2001:db8::1", 0x0303, 0xc02f),
            ],
        );

        let txt = record.to_string();
        let fingerprint = hex::encode(Sha1::digest([0x42; 16]));
        assert!(txt.starts_with("mx.example.com [addr=192.0.2.1 "));
        let second = txt.find("[addr=192.0.2.2 ").unwrap();
        let third = txt.find("[addr=2001:db8::1 ").unwrap();
        assert!(second < third);
        assert_eq!(txt.matches('[').count(), 3);
        assert!(txt.contains("tlsver=TLS1.2"));
        assert!(txt.contains("tlsver=TLS1.0"));
        assert!(txt.contains(&format!("fpr={fingerprint}")));
    }

    #[test]
    fn test_render_failed_host() {
        let record = TxtRecord::new(
            "mx.example.com".to_string(),
            vec![summary_failed("203.0.113.5", "dial tcp 203.0.113.5:25: connection refused")],
        );
        assert_eq!(
            record.to_string(),
            "mx.example.com [addr=203.0.113.5 error=connection refused starttls=no]"
        );
    }

    #[test]
    fn test_render_without_addresses() {
        let record = TxtRecord::new("mx.example.com".to_string(), Vec::new());
        assert_eq!(record.to_string(), "mx.example.com");
    }
}
