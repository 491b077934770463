//! Jabber-Id, `{ username?, hostname, resource? }` (§3 DATA MODEL).
//!
//! Grounded on the `jid` crate used throughout the teacher's workspace
//! (`examples/arachnist-xmpp-rs/jid`), but implemented in-crate: the pack did
//! not retain that crate's source, so rather than depend on an external API
//! surface we can't verify against, we model the same invariants ourselves
//! (immutable after parse, derived "bare"/"full" forms, case-folded hostname).

use std::fmt;
use std::str::FromStr;

/// Error returned when a string is not a valid JID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JidError(pub String);

impl fmt::Display for JidError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid JID: {}", self.0)
    }
}

impl std::error::Error for JidError {}

/// `user@host/resource`. Immutable once parsed (§3).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Jid {
    username: Option<String>,
    hostname: String,
    resource: Option<String>,
}

impl Jid {
    /// Build a JID from already-validated parts.
    pub fn from_parts(username: Option<&str>, hostname: &str, resource: Option<&str>) -> Self {
        Jid {
            username: username.map(|s| s.to_ascii_lowercase()),
            hostname: hostname.to_ascii_lowercase(),
            resource: resource.map(|s| s.to_owned()),
        }
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    pub fn is_bare(&self) -> bool {
        self.resource.is_none()
    }

    pub fn is_full(&self) -> bool {
        self.resource.is_some()
    }

    /// `user@host`, or `host` if there is no username.
    pub fn bare(&self) -> Jid {
        Jid {
            username: self.username.clone(),
            hostname: self.hostname.clone(),
            resource: None,
        }
    }

    /// `bare/resource`. Returns the bare form unchanged if there is no resource.
    pub fn full(&self) -> Jid {
        self.clone()
    }

    pub fn with_resource(&self, resource: &str) -> Jid {
        Jid {
            username: self.username.clone(),
            hostname: self.hostname.clone(),
            resource: Some(resource.to_owned()),
        }
    }

    /// Equality of the bare portion only, ignoring the resource.
    pub fn bare_eq(&self, other: &Jid) -> bool {
        self.username == other.username && self.hostname == other.hostname
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(user) = &self.username {
            write!(f, "{user}@{}", self.hostname)?;
        } else {
            write!(f, "{}", self.hostname)?;
        }
        if let Some(res) = &self.resource {
            write!(f, "/{res}")?;
        }
        Ok(())
    }
}

impl FromStr for Jid {
    type Err = JidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(JidError("empty JID".into()));
        }
        let (userhost, resource) = match s.split_once('/') {
            Some((a, b)) if !b.is_empty() => (a, Some(b)),
            Some((a, _)) => (a, None),
            None => (s, None),
        };
        let (username, hostname) = match userhost.split_once('@') {
            Some((u, h)) if !u.is_empty() && !h.is_empty() => (Some(u), h),
            Some(_) => return Err(JidError(s.to_owned())),
            None => (None, userhost),
        };
        if hostname.is_empty() {
            return Err(JidError(s.to_owned()));
        }
        Ok(Jid::from_parts(username, hostname, resource))
    }
}

impl TryFrom<&str> for Jid {
    type Error = JidError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_jid() {
        let jid: Jid = "Alice@Example.COM/Phone".parse().unwrap();
        assert_eq!(jid.username(), Some("alice"));
        assert_eq!(jid.hostname(), "example.com");
        assert_eq!(jid.resource(), Some("Phone"));
        assert!(jid.is_full());
    }

    #[test]
    fn bare_drops_resource() {
        let jid: Jid = "a@h/r".parse().unwrap();
        assert_eq!(jid.bare().to_string(), "a@h");
    }

    #[test]
    fn hostname_only() {
        let jid: Jid = "conference.example.com".parse().unwrap();
        assert!(jid.username().is_none());
        assert!(jid.is_bare());
    }

    #[test]
    fn rejects_malformed() {
        assert!("@h".parse::<Jid>().is_err());
        assert!("".parse::<Jid>().is_err());
    }

    #[test]
    fn bare_eq_ignores_resource() {
        let a: Jid = "a@h/r1".parse().unwrap();
        let b: Jid = "a@h/r2".parse().unwrap();
        assert!(a.bare_eq(&b));
    }
}
