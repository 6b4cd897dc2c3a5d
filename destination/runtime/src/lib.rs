#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use linkerd_destination_core as core;
pub use linkerd_destination_grpc as grpc;
pub use linkerd_destination_k8s_api as k8s;
pub use linkerd_destination_k8s_index as index;
pub use linkerd_destination_profiles as profiles;
pub use linkerd_destination_prometheus as prometheus;

mod api;
mod args;
mod primed;

pub use self::args::Args;

use std::num::NonZeroU16;

/// Serves destination lookups from the index.
#[derive(Clone, Debug)]
struct DestinationDiscover(index::SharedIndex);

impl DestinationDiscover {
    pub fn new(index: index::SharedIndex) -> Self {
        Self(index)
    }

    fn pods(&self, namespace: Option<&str>) -> Vec<index::PodSummary> {
        self.0.read().pods(namespace)
    }
}

impl core::DiscoverDestination for DestinationDiscover {
    fn subscribe_endpoints(
        &self,
        service: core::ServiceRef,
        port: NonZeroU16,
        listener: Box<dyn core::EndpointsListener>,
        closed: core::Closed,
    ) -> anyhow::Result<()> {
        // The subscription ends when `closed` fires.
        let _ = self
            .0
            .write()
            .endpoints_subscribe(service, port, listener, closed);
        Ok(())
    }

    fn subscribe_profile(
        &self,
        service: core::ServiceRef,
        listener: Box<dyn core::ProfileListener>,
        closed: core::Closed,
    ) -> anyhow::Result<()> {
        let _ = self.0.write().profile_subscribe(service, listener, closed);
        Ok(())
    }

    fn endpoints_snapshot(&self) -> Vec<core::ServicePortSnapshot> {
        self.0.read().endpoints_snapshot()
    }
}
