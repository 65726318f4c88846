//! Application initialization and resource setup.

mod logger;

pub use logger::init_logger_with;

use rustls::crypto::{ring::default_provider, CryptoProvider};

/// Initializes the crypto provider for TLS operations.
///
/// Must run before any TLS connection is attempted. Reinstalling is
/// harmless, so the result is ignored.
pub fn init_crypto_provider() {
    let _ = CryptoProvider::install_default(default_provider());
}
