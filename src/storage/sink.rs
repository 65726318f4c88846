//! Persistence sink for scan artifacts.
//!
//! Everything the pipeline produces flows through [`ResultSink::add`] as a
//! tagged [`Artifact`]. Writes are idempotent on natural keys; duplicate-key
//! conflicts are benign races between workers and are logged and counted.
//! Any other persistence failure aborts the run: a partially written scan
//! that keeps running would be indistinguishable from a complete one.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use chrono::Utc;
use log::{error, warn};
use rustls::pki_types::CertificateDer;
use sha1::{Digest, Sha1};
use sqlx::SqlitePool;
use x509_parser::prelude::parse_x509_certificate;

use crate::certs;
use crate::dns::{DnsJob, DnsJobs};
use crate::error_handling::DatabaseError;
use crate::mx::TxtRecord;
use crate::probe::MxHostSummary;
use crate::utils::unique_preserving_order;

/// A scan artifact accepted by the sink.
pub enum Artifact<'a> {
    /// An A/AAAA lookup group for one mail exchanger hostname.
    DnsGroup(&'a DnsJobs),
    /// A completed MX lookup for one domain.
    DnsJob(&'a DnsJob),
    /// One DER certificate.
    Certificate(&'a CertificateDer<'static>),
    /// A merged per-address probe summary.
    HostSummary(&'a MxHostSummary),
    /// The per-domain TXT record.
    TxtRecord(&'a TxtRecord),
}

/// Counters describing what the sink has persisted.
#[derive(Default)]
pub struct SinkStats {
    domains: AtomicU64,
    hostnames: AtomicU64,
    host_summaries: AtomicU64,
    certificates: AtomicU64,
    duplicate_keys: AtomicU64,
}

impl SinkStats {
    /// Domains whose MX lookup was persisted.
    pub fn domains(&self) -> u64 {
        self.domains.load(Ordering::Relaxed)
    }

    /// Hostnames whose TXT record was persisted.
    pub fn hostnames(&self) -> u64 {
        self.hostnames.load(Ordering::Relaxed)
    }

    /// Address summaries persisted.
    pub fn host_summaries(&self) -> u64 {
        self.host_summaries.load(Ordering::Relaxed)
    }

    /// Distinct certificates persisted.
    pub fn certificates(&self) -> u64 {
        self.certificates.load(Ordering::Relaxed)
    }

    /// Duplicate-key conflicts swallowed.
    pub fn duplicate_keys(&self) -> u64 {
        self.duplicate_keys.load(Ordering::Relaxed)
    }
}

/// Writes scan artifacts to the database.
pub struct ResultSink {
    pool: Arc<SqlitePool>,
    /// Certificates already persisted this run, keyed by SHA-1.
    known_certs: StdMutex<HashSet<[u8; 20]>>,
    stats: Arc<SinkStats>,
}

impl ResultSink {
    /// Creates a sink writing to `pool`.
    pub fn new(pool: Arc<SqlitePool>) -> Self {
        Self {
            pool,
            known_certs: StdMutex::new(HashSet::new()),
            stats: Arc::new(SinkStats::default()),
        }
    }

    /// The sink's counters.
    pub fn stats(&self) -> Arc<SinkStats> {
        Arc::clone(&self.stats)
    }

    /// Persists one artifact. Safe for concurrent use from any worker.
    ///
    /// Persistence failures other than duplicate keys abort the process.
    pub async fn add(&self, artifact: Artifact<'_>) {
        let outcome = match artifact {
            Artifact::DnsJob(job) => self.save_domain(job).await,
            Artifact::DnsGroup(group) => self.save_mx_addresses(group).await,
            Artifact::Certificate(der) => self.save_certificate(der).await,
            Artifact::HostSummary(summary) => self.save_host_summary(summary).await,
            Artifact::TxtRecord(record) => self.save_mx_domain(record).await,
        };

        if let Err(err) = outcome {
            error!("Fatal persistence failure: {err}");
            std::process::exit(1);
        }
    }

    /// Upserts the domains row with the MX lookup outcome.
    async fn save_domain(&self, job: &DnsJob) -> Result<(), DatabaseError> {
        let Some(result) = job.result() else {
            return Ok(());
        };
        let mx_hosts =
            serde_json::to_string(&result.results).unwrap_or_else(|_| "[]".to_string());

        sqlx::query(
            "INSERT INTO domains (name, mx_hosts, dns_secure, dns_error, dns_bogus)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(name) DO UPDATE SET
                 mx_hosts = excluded.mx_hosts,
                 dns_secure = excluded.dns_secure,
                 dns_error = excluded.dns_error,
                 dns_bogus = excluded.dns_bogus",
        )
        .bind(job.query().domain())
        .bind(mx_hosts)
        .bind(result.secure)
        .bind(result.error_message())
        .bind(result.bogus_reason.as_deref())
        .execute(&*self.pool)
        .await?;

        self.stats.domains.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Replaces the address records of a hostname, one address family per
    /// job in the group.
    async fn save_mx_addresses(&self, group: &DnsJobs) -> Result<(), DatabaseError> {
        for job in group.jobs() {
            let Some(result) = job.result() else { continue };
            let Some(family) = job.query().kind().family() else {
                continue;
            };
            let hostname = job.query().domain();

            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM mx_records WHERE hostname = ? AND family = ?")
                .bind(hostname)
                .bind(i64::from(family))
                .execute(&mut *tx)
                .await?;

            for address in unique_preserving_order(result.results.clone()) {
                let inserted = sqlx::query(
                    "INSERT INTO mx_records
                         (hostname, address, family, dns_secure, dns_error, dns_bogus)
                     VALUES (?, ?, ?, ?, ?, ?)
                     ON CONFLICT(hostname, address) DO NOTHING",
                )
                .bind(hostname)
                .bind(&address)
                .bind(i64::from(family))
                .bind(result.secure)
                .bind(result.error_message())
                .bind(result.bogus_reason.as_deref())
                .execute(&mut *tx)
                .await?;

                // Another worker raced us between DELETE and INSERT.
                if inserted.rows_affected() == 0 {
                    warn!("Duplicate key for mx_record {hostname} {address}");
                    self.stats.duplicate_keys.fetch_add(1, Ordering::Relaxed);
                }
            }
            tx.commit().await?;
        }
        Ok(())
    }

    /// Persists a certificate and its metadata unless already stored.
    async fn save_certificate(
        &self,
        der: &CertificateDer<'static>,
    ) -> Result<(), DatabaseError> {
        let digest: [u8; 20] = Sha1::digest(der.as_ref()).into();

        {
            let known = self
                .known_certs
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if known.contains(&digest) {
                return Ok(());
            }
        }

        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM raw_certificates WHERE id = ?")
            .bind(digest.as_slice())
            .fetch_optional(&*self.pool)
            .await?;
        if exists.is_some() {
            self.remember_certificate(digest);
            return Ok(());
        }

        let inserted = sqlx::query(
            "INSERT INTO raw_certificates (id, raw) VALUES (?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(digest.as_slice())
        .bind(der.as_ref())
        .execute(&*self.pool)
        .await?;

        if inserted.rows_affected() == 0 {
            warn!("Duplicate key for certificate {}", hex::encode(digest));
            self.stats.duplicate_keys.fetch_add(1, Ordering::Relaxed);
            self.remember_certificate(digest);
            return Ok(());
        }

        match parse_x509_certificate(der.as_ref()) {
            Ok((_, cert)) => {
                let subject_raw = cert.subject().as_raw();
                let issuer_raw = cert.issuer().as_raw();
                let subject_id: [u8; 20] = Sha1::digest(subject_raw).into();
                let issuer_id: [u8; 20] = Sha1::digest(issuer_raw).into();
                let key_id: [u8; 20] =
                    Sha1::digest(cert.tbs_certificate.subject_pki.raw).into();

                sqlx::query(
                    "INSERT INTO certificates
                         (id, subject_id, issuer_id, key_id, signature_algorithm,
                          key_algorithm, is_self_signed, is_ca, first_seen_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                     ON CONFLICT(id) DO NOTHING",
                )
                .bind(digest.as_slice())
                .bind(subject_id.as_slice())
                .bind(issuer_id.as_slice())
                .bind(key_id.as_slice())
                .bind(cert.signature_algorithm.algorithm.to_id_string())
                .bind(
                    cert.tbs_certificate
                        .subject_pki
                        .algorithm
                        .algorithm
                        .to_id_string(),
                )
                .bind(subject_raw == issuer_raw)
                .bind(certs::is_ca(&cert))
                .bind(Utc::now())
                .execute(&*self.pool)
                .await?;
            }
            Err(err) => {
                warn!(
                    "Stored raw certificate {} without metadata: {err}",
                    hex::encode(digest)
                );
            }
        }

        self.remember_certificate(digest);
        self.stats.certificates.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn remember_certificate(&self, digest: [u8; 20]) {
        self.known_certs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(digest);
    }

    /// Upserts the per-address summary row, persisting the chain first.
    async fn save_host_summary(&self, summary: &MxHostSummary) -> Result<(), DatabaseError> {
        for der in summary.chain() {
            self.save_certificate(der).await?;
        }

        let versions: Vec<String> = summary
            .tls_versions()
            .iter()
            .map(|code| format!("{code:04x}"))
            .collect();
        let ciphers: Vec<String> = summary
            .cipher_suites()
            .iter()
            .map(|code| format!("{code:04x}"))
            .collect();
        let ca_fingerprints: Vec<String> =
            summary.ca_fingerprints().iter().map(hex::encode).collect();

        sqlx::query(
            "INSERT INTO mx_hosts
                 (address, error, starttls, tls_versions, tls_cipher_suites,
                  certificate_id, ca_certificate_ids, cert_expired, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(address) DO UPDATE SET
                 error = excluded.error,
                 starttls = excluded.starttls,
                 tls_versions = excluded.tls_versions,
                 tls_cipher_suites = excluded.tls_cipher_suites,
                 certificate_id = excluded.certificate_id,
                 ca_certificate_ids = excluded.ca_certificate_ids,
                 cert_expired = excluded.cert_expired,
                 updated_at = excluded.updated_at",
        )
        .bind(summary.address().to_string())
        .bind(summary.error_message())
        .bind(summary.starttls())
        .bind(serde_json::to_string(&versions).unwrap_or_else(|_| "[]".to_string()))
        .bind(serde_json::to_string(&ciphers).unwrap_or_else(|_| "[]".to_string()))
        .bind(summary.server_fingerprint().map(|fp| fp.as_slice()))
        .bind(serde_json::to_string(&ca_fingerprints).unwrap_or_else(|_| "[]".to_string()))
        .bind(summary.certificate_expired())
        .bind(summary.updated())
        .execute(&*self.pool)
        .await?;

        self.stats.host_summaries.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Upserts the per-domain TXT record.
    async fn save_mx_domain(&self, record: &TxtRecord) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO mx_domains (name, txt) VALUES (?, ?)
             ON CONFLICT(name) DO UPDATE SET txt = excluded.txt",
        )
        .bind(record.domain())
        .bind(record.to_string())
        .execute(&*self.pool)
        .await?;

        self.stats.hostnames.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{DnsResult, RecordKind};
    use sqlx::Row;

    async fn test_sink() -> ResultSink {
        let pool = SqlitePool::connect("sqlite::memory:")
            .await
            .expect("Failed to create test database pool");
        crate::storage::run_migrations(&pool)
            .await
            .expect("Failed to run migrations");
        ResultSink::new(Arc::new(pool))
    }

    #[tokio::test]
    async fn test_save_domain_upserts() {
        let sink = test_sink().await;
        let job = crate::dns::test_job(
            "example.com",
            RecordKind::Mx,
            DnsResult {
                results: vec!["mx1.example.com".to_string()],
                ..DnsResult::default()
            },
        );

        sink.add(Artifact::DnsJob(&job)).await;
        sink.add(Artifact::DnsJob(&job)).await;

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM domains")
            .fetch_one(&*sink.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);

        let mx_hosts: String =
            sqlx::query_scalar("SELECT mx_hosts FROM domains WHERE name = 'example.com'")
                .fetch_one(&*sink.pool)
                .await
                .unwrap();
        assert_eq!(mx_hosts, r#"["mx1.example.com"]"#);
        assert_eq!(sink.stats().domains(), 2);
    }

    #[tokio::test]
    async fn test_save_mx_addresses_replaces_per_family() {
        let sink = test_sink().await;
        let group = crate::dns::test_group(vec![
            crate::dns::test_job(
                "mx.example.com",
                RecordKind::A,
                DnsResult {
                    results: vec![
                        "192.0.2.1".to_string(),
                        "192.0.2.2".to_string(),
                        "192.0.2.1".to_string(),
                    ],
                    ..DnsResult::default()
                },
            ),
            crate::dns::test_job(
                "mx.example.com",
                RecordKind::Aaaa,
                DnsResult {
                    results: vec!["2001:db8::1".to_string()],
                    ..DnsResult::default()
                },
            ),
        ]);

        sink.add(Artifact::DnsGroup(&group)).await;
        // Re-adding must not accumulate rows.
        sink.add(Artifact::DnsGroup(&group)).await;

        let rows = sqlx::query("SELECT address, family FROM mx_records ORDER BY id")
            .fetch_all(&*sink.pool)
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].get::<String, _>("address"), "192.0.2.1");
        assert_eq!(rows[2].get::<i64, _>("family"), 6);
    }

    #[tokio::test]
    async fn test_save_certificate_once() {
        let sink = test_sink().await;
        let der = CertificateDer::from(vec![0x30, 0x03, 0x02, 0x01, 0x01]);

        sink.add(Artifact::Certificate(&der)).await;
        sink.add(Artifact::Certificate(&der)).await;

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM raw_certificates")
            .fetch_one(&*sink.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(sink.stats().certificates(), 1);

        // A second sink against the same database short-circuits on the
        // existing row.
        let second = ResultSink::new(Arc::clone(&sink.pool));
        second.add(Artifact::Certificate(&der)).await;
        assert_eq!(second.stats().certificates(), 0);
    }

    #[tokio::test]
    async fn test_save_txt_record() {
        let sink = test_sink().await;
        let record = TxtRecord::new("mx.example.com".to_string(), Vec::new());

        sink.add(Artifact::TxtRecord(&record)).await;

        let txt: String =
            sqlx::query_scalar("SELECT txt FROM mx_domains WHERE name = 'mx.example.com'")
                .fetch_one(&*sink.pool)
                .await
                .unwrap();
        assert_eq!(txt, "mx.example.com");
        assert_eq!(sink.stats().hostnames(), 1);
    }
}
