use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use mx_status::config::constants;
use mx_status::initialization::init_logger_with;
use mx_status::{run_scan, Config, LogFormat, LogLevel};

/// Bulk MX/STARTTLS scanner.
///
/// Resolves the mail exchangers of the given domains, probes every
/// exchanger address for STARTTLS/TLS support, validates the presented
/// certificate chains and records one TXT summary per hostname.
#[derive(Parser, Debug)]
#[command(name = "mx_status", version, about)]
struct Opt {
    /// Domain list to scan; "-" reads stdin. Without a file, hostnames
    /// already recorded in the database are scanned.
    file: Option<PathBuf>,

    /// Also drain mail exchanger hostnames recorded in the database
    #[arg(long)]
    from_db: bool,

    /// SQLite database path
    #[arg(long, default_value = constants::DB_PATH)]
    db_path: PathBuf,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    log_level: LogLevel,

    /// Log format
    #[arg(long, value_enum, default_value = "plain")]
    log_format: LogFormat,

    /// Recursive resolver for A/AAAA/MX lookups
    #[arg(long, default_value = constants::DEFAULT_DNS_RESOLVER)]
    resolver: SocketAddr,

    /// Validating resolver for TLSA lookups (defaults to --resolver)
    #[arg(long)]
    validating_resolver: Option<SocketAddr>,

    /// DNS read timeout in seconds
    #[arg(long, default_value_t = constants::DNS_TIMEOUT_SECS)]
    dns_timeout: u64,

    /// DNS worker tasks
    #[arg(long, default_value_t = constants::DNS_WORKERS)]
    dns_workers: usize,

    /// Host-probe worker tasks
    #[arg(long, default_value_t = constants::HOST_WORKERS)]
    host_workers: usize,

    /// MX worker tasks
    #[arg(long, default_value_t = constants::MX_WORKERS)]
    mx_workers: usize,

    /// Result cache capacity per pool (0 = unbounded)
    #[arg(long, default_value_t = constants::CACHE_CAPACITY)]
    cache_capacity: usize,

    /// SMTP port to probe
    #[arg(long, default_value_t = constants::SMTP_PORT)]
    smtp_port: u16,

    /// Hostname announced in EHLO
    #[arg(long, default_value = constants::DEFAULT_EHLO_NAME)]
    ehlo_name: String,

    /// Name server receiving TXT updates (fire-and-forget)
    #[arg(long)]
    nameserver: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();

    init_logger_with(opt.log_level.clone().into(), opt.log_format.clone())
        .context("Failed to initialize logger")?;

    // Without an input file the run only makes sense against the database.
    let from_db = opt.from_db || opt.file.is_none();

    let config = Config {
        file: opt.file,
        from_db,
        db_path: opt.db_path,
        log_level: opt.log_level,
        log_format: opt.log_format,
        dns_resolver: opt.resolver,
        validating_resolver: opt.validating_resolver,
        dns_timeout_secs: opt.dns_timeout,
        dns_workers: opt.dns_workers,
        host_workers: opt.host_workers,
        mx_workers: opt.mx_workers,
        cache_capacity: opt.cache_capacity,
        smtp_port: opt.smtp_port,
        ehlo_name: opt.ehlo_name,
        nameserver: opt.nameserver,
        ..Config::default()
    };

    let report = run_scan(config).await?;

    info!(
        "Done: {} domains, {} hostnames, {} addresses, {} certificates in {:.2}s ({} duplicate keys)",
        report.domains,
        report.hostnames,
        report.addresses,
        report.certificates,
        report.elapsed_seconds,
        report.duplicate_keys
    );

    Ok(())
}
