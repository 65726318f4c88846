//! DNS resolution with per-query coalescing.
//!
//! The [`DnsProcessor`] answers A/AAAA/MX/TLSA lookups for the rest of the
//! pipeline. Concurrent identical queries are collapsed onto one in-flight
//! [`DnsJob`] that any number of callers can wait on. Two backends are used:
//! a fast recursive resolver client for A/AAAA/MX, and a validating client
//! for TLSA, whose consumers need the DNSSEC disposition of the answer.

mod client;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, OnceLock, PoisonError};
use std::time::Duration;

use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::proto::op::ResponseCode;
use hickory_resolver::proto::rr::{RData, RecordType};
use hickory_resolver::TokioAsyncResolver;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error_handling::PoolError;
use crate::pool::{WorkFn, WorkerPool};

use client::ValidatingClient;

/// The record types the scanner looks up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// IPv4 address record
    A,
    /// IPv6 address record
    Aaaa,
    /// Mail exchanger record
    Mx,
    /// TLSA (DANE) record
    Tlsa,
}

impl RecordKind {
    pub(crate) fn record_type(self) -> RecordType {
        match self {
            RecordKind::A => RecordType::A,
            RecordKind::Aaaa => RecordType::AAAA,
            RecordKind::Mx => RecordType::MX,
            RecordKind::Tlsa => RecordType::TLSA,
        }
    }

    /// The address family of an address record type (4 or 6).
    pub fn family(self) -> Option<u8> {
        match self {
            RecordKind::A => Some(4),
            RecordKind::Aaaa => Some(6),
            _ => None,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordKind::A => "A",
            RecordKind::Aaaa => "AAAA",
            RecordKind::Mx => "MX",
            RecordKind::Tlsa => "TLSA",
        };
        f.write_str(name)
    }
}

/// A lookup request. Value equality on (domain, kind) is what deduplicates
/// concurrent queries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DnsQuery {
    domain: String,
    kind: RecordKind,
}

impl DnsQuery {
    /// Builds a query with a normalized domain (lowercase, no trailing dot).
    pub fn new(domain: &str, kind: RecordKind) -> Self {
        Self {
            domain: domain.trim_end_matches('.').to_ascii_lowercase(),
            kind,
        }
    }

    /// The queried domain.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The queried record type.
    pub fn kind(&self) -> RecordKind {
        self.kind
    }
}

/// The outcome of one lookup.
#[derive(Debug, Clone, Default)]
pub struct DnsResult {
    /// Textual answer records, in answer-section order. Empty with no error
    /// means the name exists but has no records of the queried type.
    pub results: Vec<String>,
    /// Whether the validating resolver authenticated the answer (AD bit).
    /// Always false for the recursive backend.
    pub secure: bool,
    /// Why the validator rejected the answer, when it did.
    pub bogus_reason: Option<String>,
    /// Lookup failure, if any.
    pub error: Option<String>,
}

impl DnsResult {
    fn from_error(error: String) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    /// The error string, or `None` on success.
    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

/// One in-flight (or finished) lookup. Multiple waiters may block on the
/// same job; the processor owns it through its in-flight table until the
/// result is written.
pub struct DnsJob {
    query: DnsQuery,
    result: OnceLock<DnsResult>,
    done: CancellationToken,
}

impl DnsJob {
    fn new(query: DnsQuery) -> Self {
        Self {
            query,
            result: OnceLock::new(),
            done: CancellationToken::new(),
        }
    }

    /// The query this job answers.
    pub fn query(&self) -> &DnsQuery {
        &self.query
    }

    /// Waits until the lookup has finished.
    pub async fn wait(&self) {
        self.done.cancelled().await;
    }

    /// The result, once the lookup has finished.
    pub fn result(&self) -> Option<&DnsResult> {
        self.result.get()
    }

    /// Waits for completion and returns the textual answers.
    pub async fn results(&self) -> Vec<String> {
        self.wait().await;
        self.result()
            .map(|result| result.results.clone())
            .unwrap_or_default()
    }

    fn finish(&self, result: DnsResult) {
        let _ = self.result.set(result);
    }
}

/// A group of jobs created together, one per record type.
pub struct DnsJobs {
    jobs: Vec<Arc<DnsJob>>,
}

impl DnsJobs {
    /// Waits until every job in the group has finished.
    pub async fn wait(&self) {
        for job in &self.jobs {
            job.wait().await;
        }
    }

    /// The flattened results of all jobs, in the order the record types were
    /// given at creation.
    pub async fn results(&self) -> Vec<String> {
        let mut results = Vec::new();
        for job in &self.jobs {
            results.extend(job.results().await);
        }
        results
    }

    /// The constituent jobs.
    pub fn jobs(&self) -> &[Arc<DnsJob>] {
        &self.jobs
    }
}

struct DnsBackends {
    in_flight: StdMutex<HashMap<DnsQuery, Arc<DnsJob>>>,
    recursive: TokioAsyncResolver,
    validating: ValidatingClient,
}

/// Coalescing DNS lookup front-end over a worker pool.
pub struct DnsProcessor {
    shared: Arc<DnsBackends>,
    pool: WorkerPool<Arc<DnsJob>>,
}

impl DnsProcessor {
    /// Creates the processor with both resolver backends configured from
    /// `config`.
    pub fn new(config: &Config) -> Self {
        let read_timeout = Duration::from_secs(config.dns_timeout_secs);

        let mut opts = ResolverOpts::default();
        opts.timeout = read_timeout;
        opts.attempts = 2;
        // No search domains: every queried name is fully qualified.
        opts.ndots = 0;
        opts.edns0 = true;

        let mut resolver_config = ResolverConfig::new();
        resolver_config
            .add_name_server(NameServerConfig::new(config.dns_resolver, Protocol::Udp));

        let shared = Arc::new(DnsBackends {
            in_flight: StdMutex::new(HashMap::new()),
            recursive: TokioAsyncResolver::tokio(resolver_config, opts),
            validating: ValidatingClient::new(config.validating_resolver(), read_timeout),
        });

        let work_shared = Arc::clone(&shared);
        let work: WorkFn<Arc<DnsJob>> = Arc::new(move |job| {
            let shared = Arc::clone(&work_shared);
            Box::pin(async move {
                let result = shared.lookup(job.query()).await;

                // Write the result, drop the job from the in-flight table,
                // then fire the completion signal, strictly in that order: a
                // waiter that observes completion must not find the job
                // still in the table.
                job.finish(result);
                shared
                    .in_flight
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(job.query());
                job.done.cancel();
            })
        });

        Self {
            shared,
            pool: WorkerPool::new(config.dns_workers, work),
        }
    }

    /// Returns the in-flight job for (domain, kind), creating and enqueueing
    /// one when none is running.
    ///
    /// The table lookup and insertion happen under the lock; the enqueue
    /// happens after it is released.
    pub fn new_job(&self, domain: &str, kind: RecordKind) -> Result<Arc<DnsJob>, PoolError> {
        let query = DnsQuery::new(domain, kind);

        let (job, created) = {
            let mut in_flight = self
                .shared
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match in_flight.get(&query) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let job = Arc::new(DnsJob::new(query.clone()));
                    in_flight.insert(query.clone(), Arc::clone(&job));
                    (job, true)
                }
            }
        };

        if created {
            if let Err(err) = self.pool.add(Arc::clone(&job)) {
                self.shared
                    .in_flight
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&query);
                return Err(err);
            }
        }

        Ok(job)
    }

    /// Creates one job per record type and returns the group handle.
    pub fn new_jobs(&self, domain: &str, kinds: &[RecordKind]) -> Result<DnsJobs, PoolError> {
        let mut jobs = Vec::with_capacity(kinds.len());
        for kind in kinds {
            jobs.push(self.new_job(domain, *kind)?);
        }
        Ok(DnsJobs { jobs })
    }

    /// Stops accepting new queries and waits until in-flight lookups drain.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl DnsBackends {
    async fn lookup(&self, query: &DnsQuery) -> DnsResult {
        match query.kind() {
            // The validating backend is slower but carries the DNSSEC
            // verdict TLSA consumers depend on.
            RecordKind::Tlsa => self.lookup_validating(query).await,
            _ => self.lookup_recursive(query).await,
        }
    }

    async fn lookup_recursive(&self, query: &DnsQuery) -> DnsResult {
        let lookup = self
            .recursive
            .lookup(query.domain(), query.kind().record_type())
            .await;

        match lookup {
            Ok(lookup) => {
                let mut result = DnsResult::default();
                for record in lookup.record_iter() {
                    if let Some(text) = record.data().and_then(render_rdata) {
                        result.results.push(text);
                    }
                }
                result
            }
            Err(err) => match err.kind() {
                ResolveErrorKind::NoRecordsFound { response_code, .. } => {
                    match *response_code {
                        // The name exists but has no records of this type.
                        ResponseCode::NoError => DnsResult::default(),
                        code => DnsResult::from_error(rcode_name(code)),
                    }
                }
                _ => DnsResult::from_error(err.to_string()),
            },
        }
    }

    async fn lookup_validating(&self, query: &DnsQuery) -> DnsResult {
        let response = match self
            .validating
            .query(query.domain(), query.kind().record_type())
            .await
        {
            Ok(response) => response,
            Err(err) => return DnsResult::from_error(err.to_string()),
        };

        let mut result = DnsResult {
            secure: response.header().authentic_data(),
            ..DnsResult::default()
        };

        match response.response_code() {
            ResponseCode::NoError => {
                for record in response.answers() {
                    if let Some(text) = record.data().and_then(render_rdata) {
                        result.results.push(text);
                    }
                }
            }
            ResponseCode::ServFail => {
                // A validating resolver reports a validation failure as
                // SERVFAIL; the AD path cannot carry its reason.
                result.error = Some(rcode_name(ResponseCode::ServFail));
                result.bogus_reason =
                    Some("validating resolver returned SERVFAIL (possibly bogus)".to_string());
            }
            code => result.error = Some(rcode_name(code)),
        }

        result
    }
}

/// Renders an answer record to its canonical text form. Record types the
/// scanner does not ask for render to `None` and are skipped.
fn render_rdata(rdata: &RData) -> Option<String> {
    match rdata {
        RData::MX(mx) => Some(
            mx.exchange()
                .to_utf8()
                .trim_end_matches('.')
                .to_ascii_lowercase(),
        ),
        RData::A(a) => Some(a.0.to_string()),
        RData::AAAA(aaaa) => Some(aaaa.0.to_string()),
        RData::TLSA(tlsa) => Some(format!(
            "{} {} {} {}",
            u8::from(tlsa.cert_usage()),
            u8::from(tlsa.selector()),
            u8::from(tlsa.matching()),
            hex::encode(tlsa.cert_data())
        )),
        _ => None,
    }
}

/// Builds an already-completed job, for exercising consumers without a
/// resolver.
#[cfg(test)]
pub(crate) fn test_job(domain: &str, kind: RecordKind, result: DnsResult) -> Arc<DnsJob> {
    let job = Arc::new(DnsJob::new(DnsQuery::new(domain, kind)));
    job.finish(result);
    job.done.cancel();
    job
}

/// Builds a job group from completed jobs.
#[cfg(test)]
pub(crate) fn test_group(jobs: Vec<Arc<DnsJob>>) -> DnsJobs {
    DnsJobs { jobs }
}

/// The conventional uppercase name of a response code.
fn rcode_name(code: ResponseCode) -> String {
    match code {
        ResponseCode::NoError => "NOERROR".to_string(),
        ResponseCode::FormErr => "FORMERR".to_string(),
        ResponseCode::ServFail => "SERVFAIL".to_string(),
        ResponseCode::NXDomain => "NXDOMAIN".to_string(),
        ResponseCode::NotImp => "NOTIMP".to_string(),
        ResponseCode::Refused => "REFUSED".to_string(),
        other => format!("{other:?}").to_uppercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_resolver::proto::rr::rdata;
    use hickory_resolver::proto::rr::rdata::tlsa::{CertUsage, Matching, Selector};
    use hickory_resolver::proto::rr::Name;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_render_mx_lowercases_and_trims_dot() {
        let exchange = Name::from_utf8("MX1.Example.COM.").unwrap();
        let rdata = RData::MX(rdata::MX::new(10, exchange));
        assert_eq!(render_rdata(&rdata).as_deref(), Some("mx1.example.com"));
    }

    #[test]
    fn test_render_addresses() {
        let a = RData::A(rdata::A(Ipv4Addr::new(192, 0, 2, 1)));
        assert_eq!(render_rdata(&a).as_deref(), Some("192.0.2.1"));

        let aaaa = RData::AAAA(rdata::AAAA("2001:db8::1".parse::<Ipv6Addr>().unwrap()));
        assert_eq!(render_rdata(&aaaa).as_deref(), Some("2001:db8::1"));
    }

    #[test]
    fn test_render_tlsa() {
        let rdata = RData::TLSA(rdata::TLSA::new(
            CertUsage::from(3),
            Selector::from(1),
            Matching::from(1),
            vec![0xde, 0xad, 0xbe, 0xef],
        ));
        assert_eq!(render_rdata(&rdata).as_deref(), Some("3 1 1 deadbeef"));
    }

    #[test]
    fn test_query_normalization() {
        let query = DnsQuery::new("MX1.Example.COM.", RecordKind::A);
        assert_eq!(query.domain(), "mx1.example.com");
        assert_eq!(
            query,
            DnsQuery::new("mx1.example.com", RecordKind::A),
            "normalized queries must compare equal"
        );
    }

    #[test]
    fn test_rcode_names() {
        assert_eq!(rcode_name(ResponseCode::NXDomain), "NXDOMAIN");
        assert_eq!(rcode_name(ResponseCode::ServFail), "SERVFAIL");
        assert_eq!(rcode_name(ResponseCode::Refused), "REFUSED");
    }

    #[test]
    fn test_error_message_accessor() {
        let ok = DnsResult::default();
        assert!(ok.error_message().is_none());

        let failed = DnsResult::from_error("NXDOMAIN".to_string());
        assert_eq!(failed.error_message(), Some("NXDOMAIN"));
    }

    #[tokio::test]
    async fn test_group_results_preserve_type_order() {
        let a = Arc::new(DnsJob::new(DnsQuery::new("mx.example.com", RecordKind::A)));
        let aaaa = Arc::new(DnsJob::new(DnsQuery::new(
            "mx.example.com",
            RecordKind::Aaaa,
        )));

        a.finish(DnsResult {
            results: vec!["192.0.2.1".to_string(), "192.0.2.2".to_string()],
            ..DnsResult::default()
        });
        a.done.cancel();
        aaaa.finish(DnsResult {
            results: vec!["2001:db8::1".to_string()],
            ..DnsResult::default()
        });
        aaaa.done.cancel();

        let group = DnsJobs {
            jobs: vec![Arc::clone(&a), Arc::clone(&aaaa)],
        };
        group.wait().await;

        let results = group.results().await;
        assert_eq!(results, vec!["192.0.2.1", "192.0.2.2", "2001:db8::1"]);
        assert_eq!(
            results.len(),
            a.results().await.len() + aaaa.results().await.len()
        );
    }

    #[tokio::test]
    #[ignore] // Requires network access - run with `cargo test -- --ignored`
    async fn test_live_lookup_nxdomain() {
        let config = Config {
            dns_resolver: "8.8.8.8:53".parse().unwrap(),
            ..Config::default()
        };
        let processor = DnsProcessor::new(&config);

        let job = processor
            .new_job("no-such.example", RecordKind::A)
            .expect("pool accepts jobs");
        job.wait().await;

        let result = job.result().expect("completed job has a result");
        assert!(result.results.is_empty());
        assert!(result.error_message().is_some());

        processor.close().await;
    }
}
