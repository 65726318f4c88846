//! Configuration types and CLI options.
//!
//! This module defines enums and structs used for command-line argument
//! parsing and configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::ValueEnum;

use crate::config::constants;

/// Logging level for the application.
#[derive(Clone, Debug, ValueEnum)]
pub enum LogLevel {
    /// Only error messages
    Error,
    /// Error and warning messages
    Warn,
    /// Error, warning, and informational messages
    Info,
    /// All messages except trace
    Debug,
    /// All messages including trace
    Trace,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(l: LogLevel) -> Self {
        match l {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

/// Log output format.
///
/// - `Plain`: Human-readable format with colors (default)
/// - `Json`: Structured JSON format for machine parsing
#[derive(Clone, Debug, ValueEnum)]
pub enum LogFormat {
    /// Human-readable format with colors (default)
    Plain,
    /// Structured JSON format for machine parsing
    Json,
}

/// Scanner configuration (no CLI dependencies).
///
/// This is the core configuration struct used by the library. It can be
/// constructed programmatically without any CLI dependencies.
///
/// # Examples
///
/// ```no_run
/// use mx_status::Config;
/// use std::path::PathBuf;
///
/// let config = Config {
///     file: Some(PathBuf::from("domains.txt")),
///     mx_workers: 8,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Domain list to scan ("-" reads stdin). When `None`, only the
    /// hostnames already recorded in the database are drained.
    pub file: Option<PathBuf>,

    /// Also drain mail exchanger hostnames already recorded in the database.
    pub from_db: bool,

    /// Database path (SQLite file)
    pub db_path: PathBuf,

    /// Log level
    pub log_level: LogLevel,

    /// Log format
    pub log_format: LogFormat,

    /// Recursive resolver used for A/AAAA/MX lookups
    pub dns_resolver: SocketAddr,

    /// Validating resolver used for TLSA lookups (defaults to `dns_resolver`)
    pub validating_resolver: Option<SocketAddr>,

    /// DNS read timeout in seconds
    pub dns_timeout_secs: u64,

    /// DNS worker task count
    pub dns_workers: usize,

    /// Host-probe worker task count
    pub host_workers: usize,

    /// MX worker task count
    pub mx_workers: usize,

    /// Result cache capacity per pool (0 = unbounded)
    pub cache_capacity: usize,

    /// SMTP port to probe
    pub smtp_port: u16,

    /// TCP connect timeout in seconds
    pub connect_timeout_secs: u64,

    /// SMTP reply timeout in seconds
    pub smtp_timeout_secs: u64,

    /// TLS handshake timeout in seconds
    pub handshake_timeout_secs: u64,

    /// Hostname announced in EHLO
    pub ehlo_name: String,

    /// Name server to receive TXT updates (fire-and-forget); disabled when unset
    pub nameserver: Option<String>,

    /// Maximum concurrent domain ingress tasks
    pub ingress_concurrency: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            file: None,
            from_db: true,
            db_path: PathBuf::from(constants::DB_PATH),
            log_level: LogLevel::Info,
            log_format: LogFormat::Plain,
            dns_resolver: constants::DEFAULT_DNS_RESOLVER
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 53))),
            validating_resolver: None,
            dns_timeout_secs: constants::DNS_TIMEOUT_SECS,
            dns_workers: constants::DNS_WORKERS,
            host_workers: constants::HOST_WORKERS,
            mx_workers: constants::MX_WORKERS,
            cache_capacity: constants::CACHE_CAPACITY,
            smtp_port: constants::SMTP_PORT,
            connect_timeout_secs: constants::TCP_CONNECT_TIMEOUT_SECS,
            smtp_timeout_secs: constants::SMTP_REPLY_TIMEOUT_SECS,
            handshake_timeout_secs: constants::TLS_HANDSHAKE_TIMEOUT_SECS,
            ehlo_name: constants::DEFAULT_EHLO_NAME.to_string(),
            nameserver: None,
            ingress_concurrency: constants::INGRESS_CONCURRENCY,
        }
    }
}

impl Config {
    /// The resolver address used by the validating backend.
    pub fn validating_resolver(&self) -> SocketAddr {
        self.validating_resolver.unwrap_or(self.dns_resolver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(
            log::LevelFilter::from(LogLevel::Error),
            log::LevelFilter::Error
        );
        assert_eq!(
            log::LevelFilter::from(LogLevel::Trace),
            log::LevelFilter::Trace
        );
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.smtp_port, 25);
        assert!(config.dns_workers > 0);
        assert_eq!(config.validating_resolver(), config.dns_resolver);
    }

    #[test]
    fn test_validating_resolver_override() {
        let addr: SocketAddr = "192.0.2.53:53".parse().unwrap();
        let config = Config {
            validating_resolver: Some(addr),
            ..Default::default()
        };
        assert_eq!(config.validating_resolver(), addr);
    }
}
