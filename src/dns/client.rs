//! Raw DNS client for the validating backend.
//!
//! TLSA consumers need the DNSSEC disposition of an answer, which the
//! high-level resolver API does not expose. This client speaks wire-format
//! messages directly to the configured validating resolver: it sets the DO
//! bit on the query so the resolver validates, and the caller reads the AD
//! bit off the response header.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RecordType};
use log::debug;
use tokio::net::UdpSocket;
use tokio::time::timeout;

/// EDNS(0) advertised payload size. 1232 avoids IP fragmentation on
/// virtually all paths while leaving room for DNSSEC-sized answers.
const EDNS_MAX_PAYLOAD: u16 = 1232;

/// Receive buffer, sized above the advertised payload.
const RECV_BUFFER_SIZE: usize = 4096;

// TODO: retry over TCP when a response comes back with the TC bit set.

/// A minimal recursion-desired, DNSSEC-OK query client over UDP.
pub(crate) struct ValidatingClient {
    server: SocketAddr,
    timeout: Duration,
    next_id: AtomicU16,
}

impl ValidatingClient {
    pub(crate) fn new(server: SocketAddr, read_timeout: Duration) -> Self {
        // Query IDs only need to differ between in-flight queries on the
        // same socket; a counter seeded from the clock is enough.
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u16)
            .unwrap_or(1);

        Self {
            server,
            timeout: read_timeout,
            next_id: AtomicU16::new(seed),
        }
    }

    /// Sends one query and returns the raw response message.
    ///
    /// The response header carries the rcode and the AD (authenticated data)
    /// bit the caller is interested in.
    pub(crate) async fn query(&self, domain: &str, rtype: RecordType) -> Result<Message> {
        let name =
            Name::from_utf8(domain).with_context(|| format!("invalid domain name: {domain}"))?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut message = Message::new();
        message
            .set_id(id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(name, rtype));

        let mut edns = Edns::new();
        edns.set_max_payload(EDNS_MAX_PAYLOAD);
        edns.set_version(0);
        edns.set_dnssec_ok(true);
        message.set_edns(edns);

        let query_bytes = message.to_vec().context("failed to serialize DNS query")?;

        let bind_addr = if self.server.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16, 0, 0, 0, 0, 0, 0, 0], 0))
        };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .context("failed to bind UDP socket")?;
        socket
            .send_to(&query_bytes, self.server)
            .await
            .with_context(|| format!("failed to send DNS query to {}", self.server))?;

        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(anyhow!("DNS query to {} timed out", self.server));
            }

            let (len, src) = timeout(remaining, socket.recv_from(&mut buf))
                .await
                .map_err(|_| anyhow!("DNS query to {} timed out", self.server))?
                .context("failed to receive DNS response")?;

            // Datagrams from anyone but the queried resolver are noise.
            if src != self.server {
                debug!("Ignoring DNS response from unexpected source {src}");
                continue;
            }

            let response =
                Message::from_vec(&buf[..len]).context("failed to parse DNS response")?;
            if response.id() != id {
                debug!("Ignoring DNS response with mismatched id {}", response.id());
                continue;
            }

            return Ok(response);
        }
    }
}
