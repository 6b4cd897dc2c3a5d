//! Linkerd Destination Index
//!
//! Maintains the state served by the destination API. It watches the following
//! cluster resources:
//!
//! - Each `Service` declares ports, each of which maps to a target port on its
//!   backends. A port's state is materialized when it is declared or when a
//!   client subscribes to it.
//! - Each `Endpoints` lists the ready addresses of a service's backends. The
//!   addresses for a service port are those that serve its target port.
//! - `Pod` and `ReplicaSet` resources resolve backend addresses to the pods and
//!   top-level workloads that own them.
//! - `ServiceProfile` resources describe per-route policy for a service. A
//!   profile in the service's namespace takes precedence over one in the
//!   control plane namespace.
//!
//! ```text
//! [ Service ] -> [ Port ] <- [ Endpoints ] <- [ Pod ] <- [ ReplicaSet ]
//! ```
//!
//! Subscribers are notified of changes through per-listener queues so that
//! updating the index never waits on a slow client.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cluster_info;
mod endpoints;
mod index;
mod listeners;
pub mod metrics;
mod pod;
mod ports;
mod profiles;


pub use self::{
    cluster_info::ClusterInfo,
    index::{Index, SharedIndex},
    listeners::Subscription,
    pod::PodSummary,
};
