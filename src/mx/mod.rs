//! Per-hostname fan-out and fan-in.
//!
//! The [`MxProcessor`] is a cached worker pool keyed by mail exchanger
//! hostname. Each job resolves the hostname's addresses through the DNS
//! processor, probes every address through the host processor, folds the
//! summaries into one [`TxtRecord`], and hands the pieces to the sinks. The
//! rendered TXT string is the cache entry's value.

mod txt_record;

pub use txt_record::TxtRecord;

use std::net::IpAddr;
use std::sync::Arc;

use log::{info, warn};

use crate::config::Config;
use crate::dns::{DnsProcessor, RecordKind};
use crate::error_handling::PoolError;
use crate::nsupdate::NsUpdater;
use crate::pool::{CacheEntry, CachePolicy, CachedWorkerPool, WorkFn};
use crate::probe::HostProcessor;
use crate::storage::{Artifact, ResultSink};
use crate::utils::unique_preserving_order;

/// A pending or finished hostname job handle. The value is the rendered TXT
/// record.
pub type MxJob = Arc<CacheEntry<String, Arc<str>>>;

/// The address lookups fanned out per hostname, in result order.
const ADDRESS_KINDS: [RecordKind; 2] = [RecordKind::A, RecordKind::Aaaa];

struct MxContext {
    dns: Arc<DnsProcessor>,
    hosts: Arc<HostProcessor>,
    sink: Arc<ResultSink>,
    ns_updater: Option<Arc<NsUpdater>>,
}

/// Deduplicating per-hostname scan pool.
pub struct MxProcessor {
    pool: CachedWorkerPool<String, Arc<str>>,
}

impl MxProcessor {
    /// Creates the processor on top of the DNS and host processors.
    pub fn new(
        config: &Config,
        dns: Arc<DnsProcessor>,
        hosts: Arc<HostProcessor>,
        sink: Arc<ResultSink>,
        ns_updater: Option<Arc<NsUpdater>>,
    ) -> Self {
        let ctx = Arc::new(MxContext {
            dns,
            hosts,
            sink,
            ns_updater,
        });

        let work: WorkFn<MxJob> = Arc::new(move |entry| {
            let ctx = Arc::clone(&ctx);
            Box::pin(async move {
                resolve_hostname(&entry, &ctx).await;
            })
        });

        Self {
            pool: CachedWorkerPool::new(
                config.mx_workers,
                CachePolicy::from_capacity(config.cache_capacity),
                work,
            ),
        }
    }

    /// Returns the scan job for `hostname`, starting one when the hostname
    /// has not been scanned yet.
    pub async fn new_job(&self, hostname: &str) -> Result<MxJob, PoolError> {
        let hostname = hostname.trim_end_matches('.').to_ascii_lowercase();
        self.pool.new_job(hostname).await
    }

    /// The cached TXT string when the hostname is already scanned; `None`
    /// otherwise, with a job created as a side effect (fire-and-forget
    /// warming).
    pub async fn get_value(&self, hostname: &str) -> Result<Option<Arc<str>>, PoolError> {
        let job = self.new_job(hostname).await?;
        if job.is_done() {
            Ok(job.value())
        } else {
            Ok(None)
        }
    }

    /// Stops accepting new hostnames and drains running jobs.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn resolve_hostname(entry: &MxJob, ctx: &MxContext) {
    let hostname = entry.key().clone();

    let group = match ctx.dns.new_jobs(&hostname, &ADDRESS_KINDS) {
        Ok(group) => group,
        Err(err) => {
            warn!("DNS pool rejected lookups for {hostname}: {err}");
            return;
        }
    };
    group.wait().await;
    ctx.sink.add(Artifact::DnsGroup(&group)).await;

    let addresses = unique_preserving_order(group.results().await);

    let mut jobs = Vec::with_capacity(addresses.len());
    for address in &addresses {
        match address.parse::<IpAddr>() {
            Ok(ip) => match ctx.hosts.new_job(ip).await {
                Ok(job) => jobs.push(job),
                Err(err) => warn!("Host pool rejected {ip}: {err}"),
            },
            Err(_) => warn!("Ignoring unparsable address {address} for {hostname}"),
        }
    }

    let mut summaries = Vec::with_capacity(jobs.len());
    for job in jobs {
        job.wait().await;
        if let Some(summary) = job.value() {
            summaries.push(summary);
        }
    }

    let record = TxtRecord::new(hostname.clone(), summaries);
    let txt = record.to_string();
    info!("TXT: {txt}");

    entry.set_value(Arc::from(txt.as_str()));

    if let Some(ns_updater) = &ctx.ns_updater {
        ns_updater.add(&hostname, &txt);
    }
    ctx.sink.add(Artifact::TxtRecord(&record)).await;
}
