//! Endpoints, and the snapshots of them which are handed to subscribers.

use std::sync::Arc;

/// A single reachable instance of a backend pool.
#[derive(Clone, PartialEq, Eq, Debug, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Endpoint {
    pub hostname: String,
    pub port: u16,
    pub weight: u16,
}

impl Endpoint {
    pub fn new(hostname: impl ToString, port: u16, weight: u16) -> Self {
        Self {
            hostname: hostname.to_string(),
            port,
            weight,
        }
    }

    // The key used to order endpoints within a snapshot.
    //
    // Priority is always rendered as zero, and the comparison is performed on
    // the rendered string rather than on the numeric fields.
    fn canonical_key(&self) -> String {
        format!("0 {} {} {}", self.weight, self.port, self.hostname)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} (weight {})", self.hostname, self.port, self.weight)
    }
}

/// The complete membership of a target at one point in time.
///
/// Snapshots are always canonically ordered, so two snapshots holding the
/// same endpoints compare equal regardless of the order in which those
/// endpoints were discovered.
///
/// Cloning a snapshot is cheap; the endpoints themselves are shared.
#[derive(Clone, PartialEq, Eq, Debug, Default, Hash)]
pub struct Snapshot(Arc<[Endpoint]>);

impl Snapshot {
    /// Creates a snapshot, sorting `endpoints` into canonical order.
    pub fn new(endpoints: impl IntoIterator<Item = Endpoint>) -> Self {
        let mut endpoints: Vec<_> = endpoints.into_iter().collect();
        endpoints.sort_by_cached_key(Endpoint::canonical_key);
        Self(endpoints.into())
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Endpoint> {
        self.0.iter()
    }
}

impl FromIterator<Endpoint> for Snapshot {
    fn from_iter<I: IntoIterator<Item = Endpoint>>(iter: I) -> Self {
        Self::new(iter)
    }
}

impl<'a> IntoIterator for &'a Snapshot {
    type Item = &'a Endpoint;
    type IntoIter = std::slice::Iter<'a, Endpoint>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Snapshot {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}
