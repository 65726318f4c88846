//! mx_status library: bulk MX/STARTTLS scanning.
//!
//! Given a set of domains, the scanner discovers their mail exchangers,
//! resolves the exchangers' addresses, probes each address with an
//! SMTP+STARTTLS+TLS handshake, validates the presented certificate chain,
//! and records a per-domain TXT summary.
//!
//! The pipeline is three composed stages, each backed by a worker pool with
//! job coalescing so that every domain, hostname, address and DNS query is
//! processed at most once per run:
//!
//! - [`dns::DnsProcessor`]: MX/A/AAAA/TLSA lookups with per-query
//!   deduplication
//! - [`probe::HostProcessor`]: per-address TLS probing with a result cache
//! - [`mx::MxProcessor`]: per-hostname fan-out/fan-in producing TXT records
//!
//! # Example
//!
//! ```no_run
//! use mx_status::{run_scan, Config};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config {
//!     file: Some(std::path::PathBuf::from("domains.txt")),
//!     ..Default::default()
//! };
//!
//! let report = run_scan(config).await?;
//! println!(
//!     "Scanned {} hostnames across {} addresses",
//!     report.hostnames, report.addresses
//! );
//! # Ok(())
//! # }
//! ```
//!
//! This library requires a Tokio runtime.

#![warn(missing_docs)]

pub mod certs;
pub mod config;
pub mod dns;
pub mod error_handling;
pub mod initialization;
pub mod mx;
mod nsupdate;
pub mod pool;
pub mod probe;
pub mod storage;
mod utils;

pub use config::{Config, LogFormat, LogLevel};
pub use nsupdate::NsUpdater;
pub use run::{run_scan, ScanReport};

// Internal run module (pipeline assembly and ingress).
mod run {
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::{Context, Result};
    use futures::stream::FuturesUnordered;
    use futures::StreamExt;
    use log::{info, warn};
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::sync::Semaphore;
    use tokio_util::sync::CancellationToken;

    use crate::certs::TrustedRoots;
    use crate::config::{Config, LOGGING_INTERVAL_SECS};
    use crate::dns::{DnsProcessor, RecordKind};
    use crate::initialization;
    use crate::mx::MxProcessor;
    use crate::nsupdate::NsUpdater;
    use crate::probe::HostProcessor;
    use crate::storage::{self, Artifact, ResultSink, SinkStats};
    use crate::utils::unique_preserving_order;

    /// Results of a completed scan run.
    #[derive(Debug, Clone)]
    pub struct ScanReport {
        /// Domains whose MX lookup was persisted
        pub domains: u64,
        /// Hostnames scanned to a TXT record
        pub hostnames: u64,
        /// Addresses probed
        pub addresses: u64,
        /// Distinct certificates stored
        pub certificates: u64,
        /// Duplicate-key conflicts swallowed as benign races
        pub duplicate_keys: u64,
        /// Path to the SQLite database containing results
        pub db_path: PathBuf,
        /// Elapsed time in seconds
        pub elapsed_seconds: f64,
    }

    /// Runs a scan with the provided configuration.
    ///
    /// Reads domains from the configured file (and/or drains the hostnames
    /// already recorded in the database), scans them, and persists the
    /// results. Returns a summary report.
    ///
    /// # Errors
    ///
    /// Fails when the database, trust store, or input file cannot be
    /// initialized. Per-host and per-domain scan failures are recorded as
    /// data, not returned as errors.
    pub async fn run_scan(config: Config) -> Result<ScanReport> {
        initialization::init_crypto_provider();

        let pool = storage::init_db_pool(&config.db_path)
            .await
            .context("Failed to initialize database pool")?;
        storage::run_migrations(&pool)
            .await
            .context("Failed to run database migrations")?;

        let roots =
            Arc::new(TrustedRoots::load_system().context("Failed to load system trust store")?);

        let sink = Arc::new(ResultSink::new(Arc::clone(&pool)));
        let stats = sink.stats();

        let ns_updater = config
            .nameserver
            .clone()
            .map(|server| Arc::new(NsUpdater::spawn(server)));

        // Construct the pipeline in dependency order. The dependency graph
        // between pools is acyclic, which keeps cross-pool waits safe.
        let dns = Arc::new(DnsProcessor::new(&config));
        let hosts = Arc::new(HostProcessor::new(
            &config,
            Arc::clone(&roots),
            Arc::clone(&sink),
        ));
        let mx = Arc::new(MxProcessor::new(
            &config,
            Arc::clone(&dns),
            Arc::clone(&hosts),
            Arc::clone(&sink),
            ns_updater.clone(),
        ));

        let start_time = std::time::Instant::now();

        let cancel = CancellationToken::new();
        let cancel_logging = cancel.child_token();
        let stats_for_logging = Arc::clone(&stats);
        let logging_task = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(LOGGING_INTERVAL_SECS));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        log_progress(start_time, &stats_for_logging);
                    }
                    _ = cancel_logging.cancelled() => {
                        break;
                    }
                }
            }
        });

        if let Some(file) = config.file.clone() {
            ingress_from_file(&file, &config, &dns, &mx, &sink).await?;
        }
        if config.from_db {
            resolve_domain_mx_hosts(&pool, &mx).await?;
        }

        // Drain in reverse dependency order: MX workers may still create
        // host jobs, and host workers may still create DNS jobs.
        mx.close().await;
        hosts.close().await;
        dns.close().await;
        if let Some(ns_updater) = &ns_updater {
            ns_updater.close().await;
        }

        cancel.cancel();
        let _ = logging_task.await;

        log_progress(start_time, &stats);

        if let Err(e) = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&*pool)
            .await
        {
            warn!("Failed to checkpoint WAL file (this is non-critical): {e}");
        }

        Ok(ScanReport {
            domains: stats.domains(),
            hostnames: stats.hostnames(),
            addresses: stats.host_summaries(),
            certificates: stats.certificates(),
            duplicate_keys: stats.duplicate_keys(),
            db_path: config.db_path.clone(),
            elapsed_seconds: start_time.elapsed().as_secs_f64(),
        })
    }

    fn log_progress(start_time: std::time::Instant, stats: &SinkStats) {
        let elapsed = start_time.elapsed().as_secs_f64();
        let hostnames = stats.hostnames();
        info!(
            "Processed {} hostnames, {} addresses in {:.2} seconds (~{:.2} hostnames/sec)",
            hostnames,
            stats.host_summaries(),
            elapsed,
            hostnames as f64 / elapsed.max(f64::EPSILON)
        );
    }

    /// Streams domains from a file (or stdin for "-"), resolves each
    /// domain's mail exchangers, persists the lookup, and queues every
    /// exchanger on the MX processor.
    async fn ingress_from_file(
        file: &Path,
        config: &Config,
        dns: &Arc<DnsProcessor>,
        mx: &Arc<MxProcessor>,
        sink: &Arc<ResultSink>,
    ) -> Result<()> {
        let is_stdin = file.as_os_str() == "-";

        let mut stdin_lines = if is_stdin {
            info!("Reading domains from stdin");
            Some(BufReader::new(tokio::io::stdin()).lines())
        } else {
            None
        };
        let mut file_lines = if !is_stdin {
            let file = tokio::fs::File::open(file)
                .await
                .context("Failed to open input file")?;
            Some(BufReader::new(file).lines())
        } else {
            None
        };

        let semaphore = Arc::new(Semaphore::new(config.ingress_concurrency.max(1)));
        let mut tasks = FuturesUnordered::new();

        loop {
            let line_result = if let Some(lines) = stdin_lines.as_mut() {
                lines.next_line().await
            } else if let Some(lines) = file_lines.as_mut() {
                lines.next_line().await
            } else {
                Ok(None)
            };

            let line = match line_result {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read line from input: {e}");
                    continue;
                }
            };

            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let domain = trimmed.trim_end_matches('.').to_ascii_lowercase();

            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    warn!("Semaphore closed, skipping domain: {domain}");
                    continue;
                }
            };

            let dns = Arc::clone(dns);
            let mx = Arc::clone(mx);
            let sink = Arc::clone(sink);
            tasks.push(tokio::spawn(async move {
                let _permit = permit;

                let job = match dns.new_job(&domain, RecordKind::Mx) {
                    Ok(job) => job,
                    Err(err) => {
                        warn!("DNS pool rejected MX lookup for {domain}: {err}");
                        return;
                    }
                };
                job.wait().await;
                sink.add(Artifact::DnsJob(&job)).await;

                for hostname in unique_preserving_order(job.results().await) {
                    if let Err(err) = mx.new_job(&hostname).await {
                        warn!("MX pool rejected {hostname}: {err}");
                    }
                }
            }));
        }

        while let Some(task_result) = tasks.next().await {
            if let Err(join_error) = task_result {
                warn!("Ingress task panicked: {join_error:?}");
            }
        }

        Ok(())
    }

    /// Drains the mail exchanger hostnames already recorded in the domains
    /// table and queues each on the MX processor.
    async fn resolve_domain_mx_hosts(
        pool: &sqlx::SqlitePool,
        mx: &Arc<MxProcessor>,
    ) -> Result<()> {
        info!("Loading mx_hosts from domains");
        let hostnames = storage::fetch_mx_hostnames(pool)
            .await
            .context("Failed to load mail exchanger hostnames")?;
        info!("Queueing {} hostnames", hostnames.len());

        for hostname in hostnames {
            if let Err(err) = mx.new_job(&hostname).await {
                warn!("MX pool rejected {hostname}: {err}");
                break;
            }
        }
        Ok(())
    }
}
