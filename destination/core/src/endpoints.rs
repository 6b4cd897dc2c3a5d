use crate::ServiceRef;
use std::{fmt, net::SocketAddr, num::NonZeroU16};

/// Receives endpoint updates for a single service port.
///
/// Calls on a single listener are never concurrent: each listener is driven by
/// its own task, in the order that the index observed updates.
#[async_trait::async_trait]
pub trait EndpointsListener: Send + 'static {
    /// Applies a diff. Both batches are sets; order is meaningless. An
    /// endpoint in `added` replaces any prior endpoint with the same address.
    async fn update(&mut self, added: Vec<Endpoint>, removed: Vec<Endpoint>);

    /// Indicates that the service port has no endpoints. `exists` is false
    /// when the service itself is not present. Listeners should discard all
    /// previously-added endpoints.
    async fn no_endpoints(&mut self, exists: bool);
}

/// A backend address for a service port.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub addr: SocketAddr,

    /// The pod and workload that own this address. Addresses without an owner
    /// are unmeshed sources.
    pub owner: Option<Owner>,
}

/// A pod and its top-level workload.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Owner {
    pub namespace: String,
    pub pod: String,

    /// The lowercased kind of the top-level workload, e.g. `deployment`. When
    /// the pod is unowned, this is `pod`.
    pub kind: String,
    pub name: String,
}

/// References a container port on a service's backends.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TargetPort {
    Number(NonZeroU16),
    Name(String),
}

/// The materialized state of a service port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServicePortSnapshot {
    pub service: ServiceRef,
    pub port: NonZeroU16,
    pub target_port: TargetPort,
    pub endpoints: Vec<Endpoint>,

    /// The version of the endpoints resource from which `endpoints` was
    /// computed, if any.
    pub resource_version: Option<String>,

    /// Whether the service resource is present.
    pub exists: bool,
}

// === impl Endpoint ===

impl Endpoint {
    pub fn unmeshed(addr: SocketAddr) -> Self {
        Self { addr, owner: None }
    }

    pub fn is_meshed(&self) -> bool {
        self.owner.is_some()
    }
}

// === impl Owner ===

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.pod)
    }
}

// === impl TargetPort ===

impl TargetPort {
    pub fn matches(&self, name: Option<&str>, number: NonZeroU16) -> bool {
        match self {
            Self::Number(n) => *n == number,
            Self::Name(n) => Some(n.as_str()) == name,
        }
    }
}

impl fmt::Display for TargetPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => fmt::Display::fmt(n, f),
            Self::Name(n) => fmt::Display::fmt(n, f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_port_matches_by_name_or_number() {
        let http = NonZeroU16::new(8080).unwrap();
        assert!(TargetPort::Number(http).matches(Some("http"), http));
        assert!(TargetPort::Number(http).matches(None, http));
        assert!(!TargetPort::Number(http).matches(None, NonZeroU16::new(80).unwrap()));
        assert!(TargetPort::Name("http".into()).matches(Some("http"), http));
        assert!(!TargetPort::Name("http".into()).matches(Some("admin"), http));
        assert!(!TargetPort::Name("http".into()).matches(None, http));
    }

    #[test]
    fn unmeshed_endpoints_have_no_owner() {
        let ep = Endpoint::unmeshed("10.1.2.3:8080".parse().unwrap());
        assert!(!ep.is_meshed());
    }
}
