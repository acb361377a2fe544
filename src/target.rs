//! Describes what a subscriber wants to watch
use std::sync::Arc;

/// Identifies one watched backend pool.
///
/// Subscriptions to targets with the same key share a single watcher.
#[derive(Clone, Debug, PartialEq, Eq, Ord, PartialOrd, Hash)]
pub struct Key(pub Arc<str>);

impl Key {
    pub fn new(s: impl ToString) -> Self {
        Self(Arc::from(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

impl From<&'_ str> for Key {
    fn from(s: &'_ str) -> Self {
        Self(Arc::from(s))
    }
}

impl std::borrow::Borrow<str> for Key {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Key {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

/// A DNS SRV name, split into its parts.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SrvTarget {
    /// The symbolic service name, without the leading underscore.
    pub service: String,
    /// The transport protocol, without the leading underscore.
    pub protocol: String,
    /// The domain the service lives under.
    pub dns_name: String,
}

impl SrvTarget {
    pub fn new(service: impl ToString, protocol: impl ToString, dns_name: impl ToString) -> Self {
        Self {
            service: service.to_string(),
            protocol: protocol.to_string(),
            dns_name: dns_name.to_string(),
        }
    }

    /// The name which is actually queried, e.g. `_grpc._tcp.example.com`.
    pub fn qualified_name(&self) -> String {
        format!("_{}._{}.{}", self.service, self.protocol, self.dns_name)
    }
}

/// A request to watch the endpoints of a backend pool.
///
/// Each variant selects a different way of resolving endpoints.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Target {
    Srv(SrvTarget),
}

impl Target {
    pub fn srv(service: impl ToString, protocol: impl ToString, dns_name: impl ToString) -> Self {
        Target::Srv(SrvTarget::new(service, protocol, dns_name))
    }

    pub fn key(&self) -> Key {
        match self {
            Target::Srv(srv) => Key::from(srv.qualified_name()),
        }
    }
}

impl From<SrvTarget> for Target {
    fn from(srv: SrvTarget) -> Self {
        Target::Srv(srv)
    }
}
