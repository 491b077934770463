//! Bidirectional byte stream to a host/port with a security policy (§4.1).
//!
//! Grounded on `tokio-xmpp::connect::{tcp, starttls}` and the
//! `ServerConnector` trait, simplified: the spec treats the transport as
//! specified only at its contract level, so rather than the teacher's
//! generic `ServerConnector<Stream = ...>` machinery (which also supports
//! components, websockets and DNS SRV discovery) this module exposes one
//! concrete, policy-driven transport.

pub mod tcp;

use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::{Error, TransportError};

/// Security posture for a connection (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityPolicy {
    /// No encryption at all.
    None,
    /// Immediate TLS (port 5223 by convention, §6).
    Ssl,
    /// Plaintext connect, opportunistic STARTTLS upgrade.
    StartTls,
    /// Plaintext connect, STARTTLS upgrade is mandatory.
    StartTlsRequired,
}

impl SecurityPolicy {
    /// Conventional port for this policy (§6): 5223 for `Ssl`, else 5222.
    pub fn default_port(&self) -> u16 {
        match self {
            SecurityPolicy::Ssl => 5223,
            _ => 5222,
        }
    }

    pub fn requires_starttls(&self) -> bool {
        matches!(self, SecurityPolicy::StartTlsRequired)
    }
}

/// Observable transport event (§4.1): `connected`, `disconnected`, `tcpError`.
#[derive(Debug)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    TcpError(Error),
}

/// Keepalive interval: one whitespace byte written every `K` seconds of
/// silence (§4.1). `K` defaults to 60s, matching XMPP server convention.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(60);

/// Channel handle through which transport events are observed, matching the
/// event-emitter style used throughout the teacher (`Event`, `TransportEvent`,
/// etc. are plain enums pushed through a channel/stream rather than callback
/// registries).
pub type TransportEventRx = mpsc::UnboundedReceiver<TransportEvent>;
pub type TransportEventTx = mpsc::UnboundedSender<TransportEvent>;

/// Contract every transport implementation must satisfy (§4.1).
///
/// A concrete byte-stream implementation (e.g. [`tcp::TcpTransport`]) is
/// handed to [`crate::codec::StreamCodec`], which drives it with
/// `AsyncRead`/`AsyncWrite`. This trait carries the control-plane operations
/// that sit alongside the raw stream: TLS promotion, the reply watchdog, and
/// teardown.
pub trait TransportControl: Send {
    /// Promote an unencrypted stream to TLS in place (STARTTLS, §4.1).
    fn start_tls(&mut self) -> Result<(), TransportError>;

    /// Fail the connection if no inbound byte arrives before `ms` elapses.
    /// The timer resets on every inbound byte (§4.1, §5).
    fn set_reply_timeout(&mut self, ms: u64);

    /// Clear any current reply-timeout deadline (e.g. a byte arrived).
    fn clear_reply_timeout(&mut self);

    fn close(&mut self);
}
