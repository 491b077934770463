//! Host-supplied configuration (§10.3): this crate reads no files or
//! environment variables itself, matching the teacher's `xmpp::AgentBuilder`
//! posture of taking configuration entirely through constructor calls.

use std::time::Duration;

use crate::transport::SecurityPolicy;

/// Configuration for a single account/session, constructed by the embedding
/// application (§10.3).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub security_policy: SecurityPolicy,
    pub keepalive_interval: Duration,
    pub reply_timeout: Duration,
    /// Hint passed to resource binding; the server may override it.
    pub resource_hint: String,
    /// Entity-capability node URI advertised in `c.node` (§4.4).
    pub caps_node: String,
    /// `capsNode` value identifying the coopfox-capable resource, used for
    /// multicast address resolution (§4.8.2).
    pub preferred_multicast_caps_node: String,
    pub sync_watchdog: Duration,
    pub sync_low_frequency_refresh: Duration,
    pub directed_presence_rate_limit: Duration,
    pub clock_correction_slack_ms: i64,
    /// §4.4 "waits up to 500 ms of inactivity ... to declare itself online".
    pub online_settle_window: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            security_policy: SecurityPolicy::StartTls,
            keepalive_interval: Duration::from_secs(60),
            reply_timeout: Duration::from_secs(30),
            resource_hint: "coopfox".into(),
            caps_node: "http://coopfox.org/caps".into(),
            preferred_multicast_caps_node: "http://coopfox.org/caps".into(),
            sync_watchdog: Duration::from_secs(10),
            sync_low_frequency_refresh: Duration::from_secs(60),
            directed_presence_rate_limit: Duration::from_secs(5),
            clock_correction_slack_ms: 50,
            online_settle_window: Duration::from_millis(500),
        }
    }
}
