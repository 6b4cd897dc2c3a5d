use crate::{
    listeners::{EndpointsEvent, Registry},
    pod::PodIndex,
    ports,
};
use ahash::AHashMap as HashMap;
use linkerd_destination_core::{Endpoint, TargetPort};
use linkerd_destination_k8s_api as k8s;
use std::{
    net::{IpAddr, SocketAddr},
    num::NonZeroU16,
};
use tracing::{debug, warn};

/// The ready addresses of an `Endpoints` resource.
#[derive(Debug, Default)]
pub(crate) struct EndpointsState {
    pub(crate) subsets: Vec<k8s::EndpointSubset>,
    pub(crate) resource_version: Option<String>,
}

/// The materialized state of a single service port.
#[derive(Debug)]
pub(crate) struct ServicePort {
    pub(crate) target_port: TargetPort,
    pub(crate) addrs: HashMap<SocketAddr, Endpoint>,
    pub(crate) resource_version: Option<String>,

    /// Whether the service resource was present at the last update.
    pub(crate) exists: bool,

    pub(crate) listeners: Registry<EndpointsEvent>,
}

// === impl EndpointsState ===

impl EndpointsState {
    pub(crate) fn from_resource(endpoints: k8s::Endpoints) -> Self {
        Self {
            subsets: endpoints.subsets.unwrap_or_default(),
            resource_version: endpoints.metadata.resource_version,
        }
    }

    /// Computes the ready addresses that serve a target port, resolving each
    /// to its owner.
    pub(crate) fn addrs(
        &self,
        ns: &str,
        target_port: &TargetPort,
        pods: &PodIndex,
    ) -> HashMap<SocketAddr, Endpoint> {
        let mut addrs = HashMap::default();
        for subset in &self.subsets {
            let port = match resolve_port(subset, target_port) {
                Some(port) => port,
                None => continue,
            };
            for address in subset.addresses.iter().flatten() {
                let ip = match address.ip.parse::<IpAddr>() {
                    Ok(ip) => ip,
                    Err(error) => {
                        warn!(%error, ip = %address.ip, "Ignoring invalid endpoint address");
                        continue;
                    }
                };
                let addr = SocketAddr::new(ip, port.get());
                let owner = pods.resolve(ns, ip, address.target_ref.as_ref());
                addrs.insert(addr, Endpoint { addr, owner });
            }
        }
        addrs
    }

    /// Indicates whether a pod's IP is referenced by this resource.
    pub(crate) fn contains_ip(&self, ip: IpAddr) -> bool {
        self.subsets
            .iter()
            .flat_map(|s| s.addresses.iter().flatten())
            .any(|a| a.ip.parse::<IpAddr>().ok() == Some(ip))
    }
}

/// Finds the port number in a subset that serves a target port.
fn resolve_port(subset: &k8s::EndpointSubset, target: &TargetPort) -> Option<NonZeroU16> {
    subset.ports.iter().flatten().find_map(|p| {
        let port = ports::from_i32(p.port)?;
        target.matches(p.name.as_deref(), port).then_some(port)
    })
}

// === impl ServicePort ===

impl ServicePort {
    pub(crate) fn new(target_port: TargetPort, exists: bool, capacity: usize) -> Self {
        Self {
            target_port,
            addrs: HashMap::default(),
            resource_version: None,
            exists,
            listeners: Registry::new(capacity),
        }
    }

    /// The events that bring a new listener up to date.
    pub(crate) fn initial_events(&self) -> Vec<EndpointsEvent> {
        let mut events = vec![EndpointsEvent::Update {
            added: self.addrs.values().cloned().collect(),
            removed: vec![],
        }];
        if self.addrs.is_empty() {
            events.push(EndpointsEvent::NoEndpoints {
                exists: self.exists,
            });
        }
        events
    }

    /// Replaces the address set, notifying listeners of the difference.
    ///
    /// Addresses whose owner changed are re-added. When the set becomes
    /// empty, or when the service's existence changes while the set is empty,
    /// listeners are told whether the service still exists.
    pub(crate) fn update(
        &mut self,
        addrs: HashMap<SocketAddr, Endpoint>,
        resource_version: Option<String>,
        exists: bool,
    ) {
        let was_empty = self.addrs.is_empty();
        let existed = std::mem::replace(&mut self.exists, exists);
        self.resource_version = resource_version;

        let removed = self
            .addrs
            .iter()
            .filter(|(addr, _)| !addrs.contains_key(addr))
            .map(|(_, ep)| ep.clone())
            .collect::<Vec<_>>();
        let added = addrs
            .iter()
            .filter(|(addr, ep)| self.addrs.get(addr) != Some(ep))
            .map(|(_, ep)| ep.clone())
            .collect::<Vec<_>>();
        self.addrs = addrs;

        if !added.is_empty() || !removed.is_empty() {
            debug!(added = added.len(), removed = removed.len(), "Updating endpoints");
            self.listeners
                .notify(&EndpointsEvent::Update { added, removed });
        }

        if self.addrs.is_empty() && (!was_empty || existed != exists) {
            debug!(exists, "No endpoints");
            self.listeners.notify(&EndpointsEvent::NoEndpoints { exists });
        }
    }

    /// Handles the removal of the service resource. Listeners are sent the
    /// removal of every address before being told that the service does not
    /// exist.
    pub(crate) fn clear(&mut self) {
        debug!("Service deleted");
        self.update(HashMap::default(), None, false);
    }
}
