//! Configuration constants.
//!
//! This module defines the operational defaults used throughout the scanner:
//! pool sizes, timeouts and protocol parameters.

/// Default address of the recursive resolver used for A/AAAA/MX lookups.
pub const DEFAULT_DNS_RESOLVER: &str = "127.0.0.1:53";

/// DNS query read timeout in seconds.
///
/// Queries go to a local recursive resolver, so a few seconds is enough
/// headroom for cache misses without stalling a worker for long.
pub const DNS_TIMEOUT_SECS: u64 = 5;

/// Number of DNS worker tasks.
pub const DNS_WORKERS: usize = 32;

/// Number of host-probe worker tasks.
///
/// Probes spend almost all of their time blocked on the network, so this can
/// be much larger than the core count.
pub const HOST_WORKERS: usize = 64;

/// Number of MX worker tasks.
///
/// MX workers mostly block on DNS and host jobs; a small pool is enough to
/// keep the downstream pools saturated.
pub const MX_WORKERS: usize = 16;

/// Cache capacity per cached worker pool. 0 disables eviction.
pub const CACHE_CAPACITY: usize = 4096;

/// SMTP port probed on each mail exchanger address.
pub const SMTP_PORT: u16 = 25;

/// TCP connection timeout in seconds.
pub const TCP_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Timeout in seconds for each SMTP reply (banner, EHLO, STARTTLS).
///
/// Mail servers are allowed to greet slowly (some tarpit deliberately), so
/// this is more generous than the connect timeout.
pub const SMTP_REPLY_TIMEOUT_SECS: u64 = 30;

/// TLS handshake timeout in seconds.
pub const TLS_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Hostname announced in the EHLO command.
pub const DEFAULT_EHLO_NAME: &str = "mx-status.invalid";

/// Maximum concurrent domain ingress tasks.
pub const INGRESS_CONCURRENCY: usize = 64;

/// Progress logging interval in seconds.
pub const LOGGING_INTERVAL_SECS: u64 = 5;

/// Default SQLite database path.
pub const DB_PATH: &str = "./mx_status.db";
