//! Peer-to-peer MUC-lite group chat runtime on top of one-to-one [XMPP](https://xmpp.org/)
//! messaging, built with asynchronous I/O using [tokio](https://tokio.rs/).
//!
//! The layers, leaves first, mirror the architecture of `tokio-xmpp`/`xmpp`:
//!
//! - [`transport`]: TCP socket with optional TLS/STARTTLS, keepalive and reply watchdog.
//! - [`codec`]: incremental XML stream reader/writer scoped to `<stream:stream>`.
//! - [`session`]: handshake (TLS, SASL, bind, session, disco) and stanza dispatch.
//! - [`client`]: roster, presence, entity capabilities, pub-sub, validation.
//! - [`failsafe`]: reconnect/offline wrapper around [`client::Client`].
//! - [`hub`]: multiplexes inbound messages to [`thread`] instances.
//! - [`thread`]: contact / strict / multi-user conversation threads.
//! - [`agent`]: owns [`failsafe::FailsafeClient`] and [`hub::Hub`] together,
//!   driving the latter from the former's event stream.

#![deny(unsafe_code)]

pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod jid;
pub mod stanza;
pub mod transport;

pub mod caps;
pub mod coopfox_ext;
pub mod roster;
pub mod sasl_digest;
pub mod session;

pub mod agent;
pub mod client;
pub mod failsafe;
pub mod hub;
pub mod persistence;
pub mod thread;

pub use error::Error;
pub use stanza::Stanza;
