//! A single SMTP+STARTTLS+TLS connection attempt.
//!
//! Each grab walks the probe state machine once at one protocol-version
//! ceiling: connect, read the SMTP greeting, EHLO, request STARTTLS, then
//! negotiate TLS. A terminal failure at any step records the error and
//! stops the probe.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, NamedGroup};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use super::ProbeConfig;

/// The negotiated key-exchange parameters of a TLS handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum KeyExchange {
    /// No handshake reached or nothing negotiated.
    #[default]
    None,
    /// Elliptic-curve ephemeral Diffie-Hellman.
    Ecdhe {
        /// IANA group code
        group: u16,
        /// Group name, e.g. "X25519"
        name: String,
    },
    /// A non-EC group (finite-field DH).
    Other {
        /// IANA group code
        group: u16,
        /// Group name
        name: String,
    },
}

impl KeyExchange {
    fn from_group(group: NamedGroup) -> Self {
        let code = u16::from(group);
        let name = format!("{group:?}");
        match group {
            NamedGroup::X25519
            | NamedGroup::X448
            | NamedGroup::secp256r1
            | NamedGroup::secp384r1
            | NamedGroup::secp521r1 => KeyExchange::Ecdhe { group: code, name },
            _ => KeyExchange::Other { group: code, name },
        }
    }

    /// The curve name when the exchange was elliptic-curve based.
    pub fn curve_name(&self) -> Option<&str> {
        match self {
            KeyExchange::Ecdhe { name, .. } => Some(name),
            _ => None,
        }
    }
}

/// What one connection attempt observed.
#[derive(Debug, Default)]
pub struct HostGrab {
    /// Whether the server accepted the STARTTLS upgrade. `None` when the
    /// probe failed before STARTTLS was requested.
    pub starttls: Option<bool>,
    /// Negotiated protocol version code.
    pub tls_version: Option<u16>,
    /// Negotiated cipher suite code.
    pub cipher_suite: Option<u16>,
    /// Certificate chain as presented, server certificate first.
    pub chain: Vec<CertificateDer<'static>>,
    /// Negotiated key-exchange parameters.
    pub key_exchange: KeyExchange,
    /// First error encountered, unsimplified.
    pub error: Option<String>,
}

impl HostGrab {
    /// Whether the TLS handshake completed and produced a certificate chain.
    pub fn tls_successful(&self) -> bool {
        !self.chain.is_empty()
    }
}

/// Performs one probe against `address` with the protocol versions allowed
/// by `tls_config`.
pub(crate) async fn grab_host(
    address: IpAddr,
    tls_config: Arc<ClientConfig>,
    config: &ProbeConfig,
) -> HostGrab {
    let mut grab = HostGrab::default();
    let addr = SocketAddr::new(address, config.port);

    let stream = match timeout(config.connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            grab.error = Some(format!("Could not connect: dial tcp {addr}: {err}"));
            return grab;
        }
        Err(_) => {
            grab.error = Some(format!("Could not connect: dial tcp {addr}: i/o timeout"));
            return grab;
        }
    };

    let mut stream = BufReader::new(stream);

    if let Err(err) = exchange(&mut stream, None, 220, "greeting", config, addr).await {
        grab.error = Some(err);
        return grab;
    }

    let ehlo = format!("EHLO {}", config.ehlo_name);
    if let Err(err) = exchange(&mut stream, Some(&ehlo), 250, "EHLO", config, addr).await {
        grab.error = Some(err);
        return grab;
    }

    match exchange(&mut stream, Some("STARTTLS"), 220, "STARTTLS", config, addr).await {
        Ok(()) => grab.starttls = Some(true),
        Err(err) => {
            grab.starttls = Some(false);
            grab.error = Some(err);
            return grab;
        }
    }

    let tcp = stream.into_inner();
    let connector = TlsConnector::from(tls_config);
    let server_name = ServerName::IpAddress(address.into());

    match timeout(config.handshake_timeout, connector.connect(server_name, tcp)).await {
        Ok(Ok(tls_stream)) => {
            let (_, connection) = tls_stream.get_ref();
            grab.tls_version = connection.protocol_version().map(u16::from);
            grab.cipher_suite = connection
                .negotiated_cipher_suite()
                .map(|suite| u16::from(suite.suite()));
            if let Some(certs) = connection.peer_certificates() {
                grab.chain = certs.to_vec();
            }
            if let Some(group) = connection.negotiated_key_exchange_group() {
                grab.key_exchange = KeyExchange::from_group(group.name());
            }
        }
        Ok(Err(err)) => {
            grab.error = Some(format!("Conversation error: TLS handshake: {err}"));
        }
        Err(_) => {
            grab.error = Some("Conversation error: TLS handshake: i/o timeout".to_string());
        }
    }

    grab
}

/// Sends an optional command and expects a reply with the given code.
async fn exchange(
    stream: &mut BufReader<TcpStream>,
    command: Option<&str>,
    expected: u16,
    step: &str,
    config: &ProbeConfig,
    addr: SocketAddr,
) -> Result<(), String> {
    if let Some(command) = command {
        let payload = format!("{command}\r\n");
        if let Err(err) = stream.get_mut().write_all(payload.as_bytes()).await {
            return Err(format!("write tcp {addr}: {err}"));
        }
    }

    let (code, text) = read_reply(stream, config, addr).await?;
    if code != expected {
        return Err(format!("Conversation error: {step} rejected: {code} {text}"));
    }
    Ok(())
}

/// Reads one (possibly multiline) SMTP reply.
async fn read_reply(
    stream: &mut BufReader<TcpStream>,
    config: &ProbeConfig,
    addr: SocketAddr,
) -> Result<(u16, String), String> {
    let mut line = String::new();
    loop {
        line.clear();
        match timeout(config.reply_timeout, stream.read_line(&mut line)).await {
            Ok(Ok(0)) => return Err(format!("read tcp {addr}: connection closed")),
            Ok(Ok(_)) => {}
            Ok(Err(err)) => return Err(format!("read tcp {addr}: {err}")),
            Err(_) => return Err(format!("read tcp {addr}: i/o timeout")),
        }

        let reply = line.trim_end();
        if reply.len() < 3 {
            return Err(format!("Conversation error: malformed reply: {reply}"));
        }
        let code: u16 = reply[..3]
            .parse()
            .map_err(|_| format!("Conversation error: malformed reply: {reply}"))?;

        // A hyphen after the code marks a continuation line.
        if reply.len() == 3 || reply.as_bytes()[3] == b' ' {
            return Ok((code, reply[3..].trim_start().to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_exchange_classification() {
        let x25519 = KeyExchange::from_group(NamedGroup::X25519);
        assert_eq!(x25519.curve_name(), Some("X25519"));

        let ffdhe = KeyExchange::from_group(NamedGroup::FFDHE2048);
        assert_eq!(ffdhe.curve_name(), None);
        assert!(matches!(ffdhe, KeyExchange::Other { .. }));
    }

    #[test]
    fn test_grab_defaults() {
        let grab = HostGrab::default();
        assert_eq!(grab.starttls, None);
        assert!(!grab.tls_successful());
        assert_eq!(grab.key_exchange, KeyExchange::None);
    }
}
