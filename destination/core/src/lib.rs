#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod endpoints;
pub mod profile;

pub use self::{
    endpoints::{Endpoint, EndpointsListener, Owner, ServicePortSnapshot, TargetPort},
    profile::{
        Profile, ProfileListener, RequestMatch, ResponseClass, ResponseMatch, RetryBudget,
        RouteSpec,
    },
};
use anyhow::Result;
use std::{fmt, future::Future, num::NonZeroU16, pin::Pin};

/// Completes when the consumer of a subscription goes away (e.g. a client
/// disconnects or a request is cancelled).
pub type Closed = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Identifies a Kubernetes Service.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceRef {
    pub namespace: String,
    pub name: String,
}

/// Models destination discovery as consumed by the proxy API.
pub trait DiscoverDestination {
    /// Registers a listener for a service port's endpoints. The listener
    /// receives the full current state first, then incremental updates,
    /// until `closed` completes.
    fn subscribe_endpoints(
        &self,
        service: ServiceRef,
        port: NonZeroU16,
        listener: Box<dyn EndpointsListener>,
        closed: Closed,
    ) -> Result<()>;

    /// Registers a listener for a service's profile. `None` is delivered
    /// when the service has no profile.
    fn subscribe_profile(
        &self,
        service: ServiceRef,
        listener: Box<dyn ProfileListener>,
        closed: Closed,
    ) -> Result<()>;

    /// Returns every known service port.
    fn endpoints_snapshot(&self) -> Vec<ServicePortSnapshot>;
}

// === impl ServiceRef ===

impl ServiceRef {
    pub fn new(namespace: impl ToString, name: impl ToString) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// The fully-qualified DNS name of the service, e.g.
    /// `voting.emojivoto.svc.cluster.local`.
    pub fn fqdn(&self, cluster_domain: &str) -> String {
        format!("{}.{}.svc.{}", self.name, self.namespace, cluster_domain)
    }
}

impl fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_fqdn() {
        let svc = ServiceRef::new("emojivoto", "voting");
        assert_eq!(svc.fqdn("cluster.local"), "voting.emojivoto.svc.cluster.local");
        assert_eq!(svc.to_string(), "emojivoto/voting");
    }
}
