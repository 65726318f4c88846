//! Per-address STARTTLS/TLS probing.
//!
//! The [`HostProcessor`] is a cached worker pool keyed by IP address: each
//! address is probed at most once per run, and every caller interested in it
//! shares the same [`MxHostSummary`]. A probe issues an SMTP+STARTTLS+TLS
//! handshake at the modern version ceiling and, when the host negotiated
//! above the legacy ceiling, a second one capped at the legacy ceiling to
//! learn whether older clients could still connect.

mod error;
mod grab;
mod summary;

pub use grab::{HostGrab, KeyExchange};
pub use summary::MxHostSummary;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};

use crate::certs::TrustedRoots;
use crate::config::Config;
use crate::error_handling::PoolError;
use crate::pool::{CacheEntry, CachePolicy, CachedWorkerPool, WorkFn};
use crate::storage::{Artifact, ResultSink};

/// A pending or finished probe job handle.
pub type HostJob = Arc<CacheEntry<IpAddr, Arc<MxHostSummary>>>;

/// Protocol version code of TLS 1.2, the legacy probing ceiling.
const LEGACY_CEILING: u16 = 0x0303;

/// Connection parameters of a probe.
#[derive(Debug, Clone)]
pub(crate) struct ProbeConfig {
    pub port: u16,
    pub connect_timeout: Duration,
    pub reply_timeout: Duration,
    pub handshake_timeout: Duration,
    pub ehlo_name: String,
}

impl ProbeConfig {
    fn from_config(config: &Config) -> Self {
        Self {
            port: config.smtp_port,
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            reply_timeout: Duration::from_secs(config.smtp_timeout_secs),
            handshake_timeout: Duration::from_secs(config.handshake_timeout_secs),
            ehlo_name: config.ehlo_name.clone(),
        }
    }
}

/// A certificate verifier that accepts everything the peer presents.
///
/// The scanner records whatever chain a server offers and judges it
/// separately against the trust store; rejecting at handshake time would
/// lose exactly the data the scan is after.
#[derive(Debug)]
struct AcceptAllVerifier;

impl ServerCertVerifier for AcceptAllVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
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
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}

fn tls_config(versions: &[&'static rustls::SupportedProtocolVersion]) -> Arc<ClientConfig> {
    Arc::new(
        ClientConfig::builder_with_protocol_versions(versions)
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAllVerifier))
            .with_no_client_auth(),
    )
}

struct HostContext {
    probe: ProbeConfig,
    tls_modern: Arc<ClientConfig>,
    tls_legacy: Arc<ClientConfig>,
    roots: Arc<TrustedRoots>,
    sink: Arc<ResultSink>,
}

/// Deduplicating per-address probe pool.
pub struct HostProcessor {
    pool: CachedWorkerPool<IpAddr, Arc<MxHostSummary>>,
}

impl HostProcessor {
    /// Creates the processor with its worker pool and TLS configurations.
    pub fn new(config: &Config, roots: Arc<TrustedRoots>, sink: Arc<ResultSink>) -> Self {
        let ctx = Arc::new(HostContext {
            probe: ProbeConfig::from_config(config),
            tls_modern: tls_config(&[&rustls::version::TLS13, &rustls::version::TLS12]),
            tls_legacy: tls_config(&[&rustls::version::TLS12]),
            roots,
            sink,
        });

        let work: WorkFn<HostJob> = Arc::new(move |entry| {
            let ctx = Arc::clone(&ctx);
            Box::pin(async move {
                let address = *entry.key();
                debug!("Probing {address}");

                let summary = Arc::new(probe_address(address, &ctx).await);
                ctx.sink.add(Artifact::HostSummary(&summary)).await;
                entry.set_value(summary);
            })
        });

        Self {
            pool: CachedWorkerPool::new(
                config.host_workers,
                CachePolicy::from_capacity(config.cache_capacity),
                work,
            ),
        }
    }

    /// Returns the probe job for `address`, starting one if the address has
    /// not been probed yet.
    pub async fn new_job(&self, address: IpAddr) -> Result<HostJob, PoolError> {
        self.pool.new_job(address).await
    }

    /// Stops accepting new addresses and drains running probes.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn probe_address(address: IpAddr, ctx: &HostContext) -> MxHostSummary {
    let mut summary = MxHostSummary::new(address);

    let first = grab::grab_host(address, Arc::clone(&ctx.tls_modern), &ctx.probe).await;
    summary.record_first(&first);

    if summary.starttls() == Some(true) {
        let above_legacy = first.tls_version.is_some_and(|version| version > LEGACY_CEILING);
        summary.append(first);

        // Learn whether the host also speaks an older protocol version.
        // A failure of the legacy probe is discarded.
        if above_legacy {
            let legacy = grab::grab_host(address, Arc::clone(&ctx.tls_legacy), &ctx.probe).await;
            if legacy.tls_successful() {
                summary.append(legacy);
            }
        }
    }

    summary.finalize(&ctx.roots);
    summary
}

/// Human-readable name of a TLS protocol version code.
pub fn tls_version_name(code: u16) -> String {
    match code {
        0x0300 => "SSL3.0".to_string(),
        0x0301 => "TLS1.0".to_string(),
        0x0302 => "TLS1.1".to_string(),
        0x0303 => "TLS1.2".to_string(),
        0x0304 => "TLS1.3".to_string(),
        other => format!("0x{other:04x}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_version_names() {
        assert_eq!(tls_version_name(0x0303), "TLS1.2");
        assert_eq!(tls_version_name(0x0304), "TLS1.3");
        assert_eq!(tls_version_name(0x1234), "0x1234");
    }

    #[tokio::test]
    #[ignore] // Requires network access - run with `cargo test -- --ignored`
    async fn test_probe_unroutable_address_reports_connect_error() {
        crate::initialization::init_crypto_provider();

        let ctx = HostContext {
            probe: ProbeConfig {
                port: 25,
                connect_timeout: Duration::from_secs(2),
                reply_timeout: Duration::from_secs(2),
                handshake_timeout: Duration::from_secs(2),
                ehlo_name: "test.invalid".to_string(),
            },
            tls_modern: tls_config(&[&rustls::version::TLS13, &rustls::version::TLS12]),
            tls_legacy: tls_config(&[&rustls::version::TLS12]),
            roots: Arc::new(TrustedRoots::from_der(Vec::new())),
            sink: Arc::new(crate::storage::ResultSink::new(Arc::new(
                sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap(),
            ))),
        };

        // 192.0.2.0/24 is TEST-NET-1 and never routable.
        let summary = probe_address("192.0.2.1".parse().unwrap(), &ctx).await;
        assert!(summary.error_message().is_some());
        assert_eq!(summary.starttls(), None);
        assert!(summary.chain().is_empty());
    }
}
