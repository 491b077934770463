//! Error taxonomy. Hand-written enums with manual `Display`/`Error` impls,
//! following the style of `tokio-xmpp::error` rather than a derive-macro crate.

use std::error::Error as StdError;
use std::fmt;
use std::io;

/// Top-level error returned by session/client/transport operations.
#[derive(Debug)]
pub enum Error {
    /// I/O error from the underlying transport.
    Io(io::Error),
    /// Error parsing a Jabber-Id.
    JidParse(crate::jid::JidError),
    /// Protocol-level error (fatal to the session, see §4.3/§7).
    Protocol(ProtocolError),
    /// Authentication error (fatal to the session).
    Auth(AuthError),
    /// Transport-level error (fatal to the session).
    Transport(TransportError),
    /// Connection closed.
    Disconnected,
    /// A state-machine assertion was violated. Should never happen.
    InvalidState,
    /// Synchronous stanza validation failure (§4.4, §7 "Validation").
    Validation(ValidationError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::JidParse(e) => write!(f, "JID parse error: {e}"),
            Error::Protocol(e) => write!(f, "protocol error: {e}"),
            Error::Auth(e) => write!(f, "authentication error: {e}"),
            Error::Transport(e) => write!(f, "transport error: {e}"),
            Error::Disconnected => write!(f, "disconnected"),
            Error::InvalidState => write!(f, "invalid state"),
            Error::Validation(e) => write!(f, "validation error: {e}"),
        }
    }
}

impl StdError for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

impl From<AuthError> for Error {
    fn from(e: AuthError) -> Self {
        Error::Auth(e)
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Error::Transport(e)
    }
}

impl From<crate::jid::JidError> for Error {
    fn from(e: crate::jid::JidError) -> Self {
        Error::JidParse(e)
    }
}

impl From<ValidationError> for Error {
    fn from(e: ValidationError) -> Self {
        Error::Validation(e)
    }
}

/// XMPP protocol-level error: unexpected state transition, malformed
/// handshake response, disco/bind failure (§4.3, §7 "Protocol").
#[derive(Debug)]
pub enum ProtocolError {
    /// XML parser error.
    Parser(String),
    /// No TLS available where required.
    NoTls,
    /// `starttls_required` but the server omitted STARTTLS.
    StarttlsRequired,
    /// Invalid response to resource binding.
    InvalidBindResponse,
    /// Missing or unparseable `xmlns`/`id` on `<stream:stream>`.
    NoStreamNamespace,
    /// Encountered an unexpected XML token for the current state.
    InvalidToken,
    /// An assertion about the current [`crate::session::SessionState`] failed.
    UnexpectedState { expected: &'static str, actual: &'static str },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProtocolError::Parser(e) => write!(f, "XML parser error: {e}"),
            ProtocolError::NoTls => write!(f, "no TLS available"),
            ProtocolError::StarttlsRequired => {
                write!(f, "server did not advertise STARTTLS but it is required")
            }
            ProtocolError::InvalidBindResponse => write!(f, "invalid response to resource binding"),
            ProtocolError::NoStreamNamespace => write!(f, "no xmlns attribute in <stream:stream>"),
            ProtocolError::InvalidToken => write!(f, "encountered an unexpected XML token"),
            ProtocolError::UnexpectedState { expected, actual } => {
                write!(f, "expected state {expected}, was in {actual}")
            }
        }
    }
}

impl StdError for ProtocolError {}

/// SASL negotiation failure (§4.3, §7).
#[derive(Debug)]
pub enum AuthError {
    /// No local mechanism matches one advertised by the server.
    NoMechanism,
    /// Malformed DIGEST-MD5 challenge.
    MalformedChallenge(String),
    /// Failure reported by the server (`<failure>` condition name).
    Fail(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AuthError::NoMechanism => write!(f, "no matching SASL mechanism available"),
            AuthError::MalformedChallenge(e) => write!(f, "malformed DIGEST-MD5 challenge: {e}"),
            AuthError::Fail(c) => write!(f, "failure from the server: {c}"),
        }
    }
}

impl StdError for AuthError {}

/// Transport-level error (§4.1, §7 "Transport").
#[derive(Debug)]
pub enum TransportError {
    /// TCP connect/read/write failure.
    Tcp(String),
    /// TLS handshake failure.
    Tls(String),
    /// Certificate validation failure, with a subclass.
    BadCertificate(CertificateProblem, String),
}

/// Subclass of a certificate validation failure (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateProblem {
    DomainMismatch,
    Expired,
    Untrusted,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransportError::Tcp(e) => write!(f, "TCP error: {e}"),
            TransportError::Tls(e) => write!(f, "TLS error: {e}"),
            TransportError::BadCertificate(problem, reason) => {
                write!(f, "bad certificate ({problem:?}): {reason}")
            }
        }
    }
}

impl StdError for TransportError {}

/// Synchronous, non-fatal validation failure surfaced to the caller
/// (§4.4, §7 "Validation").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    InvalidJid(String),
    InvalidStanzaType(String),
    InvalidThreadId(String),
    DuplicateStrictThreadId(String),
    UnknownParentThread(String),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ValidationError::InvalidJid(s) => write!(f, "invalid JID: {s}"),
            ValidationError::InvalidStanzaType(s) => write!(f, "invalid stanza type: {s}"),
            ValidationError::InvalidThreadId(s) => write!(f, "invalid thread id: {s}"),
            ValidationError::DuplicateStrictThreadId(s) => {
                write!(f, "duplicate strict thread id: {s}")
            }
            ValidationError::UnknownParentThread(s) => write!(f, "unknown parent thread: {s}"),
        }
    }
}

impl StdError for ValidationError {}

/// History-sync protocol failure (§4.8.4, §7 "Sync").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The responder returned an iq error stanza.
    PullError(String),
    /// The sync watchdog (10s) expired before a response arrived.
    PullTimeout,
    /// After import, the requester's version still does not match the
    /// announced responder version.
    VersionDivergence,
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SyncError::PullError(e) => write!(f, "pull error: {e}"),
            SyncError::PullTimeout => write!(f, "pull timed out"),
            SyncError::VersionDivergence => write!(f, "version divergence after import"),
        }
    }
}

impl StdError for SyncError {}
