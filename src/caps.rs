//! Entity capabilities hash, XEP-0115 (§4.4).
//!
//! Grounded on `xmpp_parsers::caps`/`disco`, reimplemented against this
//! crate's own identity/feature representation since `xmpp-parsers` itself
//! isn't a dependency here (see `DESIGN.md`).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};

/// `{ category, type, name }` advertised in disco#info (§4.4).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Identity {
    pub category: String,
    pub kind: String,
    pub name: String,
}

impl Identity {
    pub fn new(category: impl Into<String>, kind: impl Into<String>, name: impl Into<String>) -> Self {
        Identity {
            category: category.into(),
            kind: kind.into(),
            name: name.into(),
        }
    }
}

/// The fixed set of identities/features this client advertises.
#[derive(Debug, Clone, Default)]
pub struct CapsProfile {
    pub identities: Vec<Identity>,
    pub features: Vec<String>,
}

impl CapsProfile {
    /// Compute the XEP-0115 ver string: canonicalize identities as
    /// `"cat/type//name<"`, features as `"feature<"`, sorted, sha-1, base64
    /// (§4.4).
    pub fn ver(&self) -> String {
        let mut identities = self.identities.clone();
        identities.sort();
        let mut features = self.features.clone();
        features.sort();
        features.dedup();

        let mut s = String::new();
        for id in &identities {
            s.push_str(&id.category);
            s.push('/');
            s.push_str(&id.kind);
            s.push('/');
            s.push('/');
            s.push_str(&id.name);
            s.push('<');
        }
        for f in &features {
            s.push_str(f);
            s.push('<');
        }

        let digest = Sha1::digest(s.as_bytes());
        BASE64.encode(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ver_is_stable_and_order_independent() {
        let a = CapsProfile {
            identities: vec![Identity::new("client", "pc", "CoopFox")],
            features: vec!["http://jabber.org/protocol/disco#info".into(), "http://coopfox.org/caps".into()],
        };
        let mut b = a.clone();
        b.features.reverse();
        assert_eq!(a.ver(), b.ver());
        assert!(!a.ver().is_empty());
    }

    #[test]
    fn ver_changes_with_feature_set() {
        let a = CapsProfile {
            identities: vec![Identity::new("client", "pc", "CoopFox")],
            features: vec!["http://jabber.org/protocol/disco#info".into()],
        };
        let mut b = a.clone();
        b.features.push("http://coopfox.org/caps".into());
        assert_ne!(a.ver(), b.ver());
    }
}
