use crate::{
    endpoints::{EndpointsState, ServicePort},
    listeners::Subscription,
    pod::{PodIndex, PodSummary},
    ports::{self, PortMap},
    profiles::ProfileIndex,
    ClusterInfo,
};
use ahash::AHashMap as HashMap;
use linkerd_destination_core::{
    Closed, Endpoint, EndpointsListener, ProfileListener, ServicePortSnapshot, ServiceRef,
    TargetPort,
};
use linkerd_destination_k8s_api::{self as k8s, ResourceExt, ServiceProfile};
use parking_lot::RwLock;
use std::{
    collections::hash_map::Entry,
    net::{IpAddr, SocketAddr},
    num::NonZeroU16,
    sync::Arc,
};
use tracing::debug;

pub type SharedIndex = Arc<RwLock<Index>>;

/// Holds all indexing state. Updated by the tasks that process watch events
/// and read by the API servers.
#[derive(Debug)]
pub struct Index {
    cluster_info: Arc<ClusterInfo>,
    services: HashMap<ServiceRef, Service>,
    pods: PodIndex,
    profiles: ProfileIndex,
}

#[derive(Debug, Default)]
struct Service {
    /// The target port of each port declared by the service resource. `None`
    /// when the service resource does not exist.
    spec: Option<PortMap<TargetPort>>,

    endpoints: Option<EndpointsState>,

    /// Ports that are declared or have listeners.
    ports: PortMap<ServicePort>,
}

// === impl Index ===

impl Index {
    pub fn shared(cluster_info: Arc<ClusterInfo>) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            cluster_info,
            services: HashMap::default(),
            pods: PodIndex::default(),
            profiles: ProfileIndex::default(),
        }))
    }

    /// Subscribes a listener to a service port's endpoints.
    ///
    /// The listener first receives the port's complete address set. The
    /// subscription ends when `closed` completes.
    pub fn endpoints_subscribe(
        &mut self,
        service: ServiceRef,
        port: NonZeroU16,
        listener: Box<dyn EndpointsListener>,
        closed: Closed,
    ) -> Subscription {
        self.gc();
        debug!(%service, %port, "Subscribing to endpoints");
        let capacity = self.cluster_info.listener_queue_capacity;
        let svc = self.services.entry(service.clone()).or_default();
        let sp = svc.port_or_default(&service.namespace, port, &self.pods, capacity);
        let initial = sp.initial_events();
        sp.listeners.subscribe(listener, initial, closed)
    }

    /// Subscribes a listener to a service's profile.
    pub fn profile_subscribe(
        &mut self,
        service: ServiceRef,
        listener: Box<dyn ProfileListener>,
        closed: Closed,
    ) -> Subscription {
        self.profiles.gc();
        debug!(%service, "Subscribing to profile");
        let state = self
            .profiles
            .service_or_default(service, &self.cluster_info);
        let initial = state.initial_events();
        state.listeners.subscribe(listener, initial, closed)
    }

    /// Returns the current state of a service port.
    pub fn snapshot(&self, service: &ServiceRef, port: NonZeroU16) -> ServicePortSnapshot {
        let svc = self.services.get(service);
        if let Some(sp) = svc.and_then(|svc| svc.ports.get(&port)) {
            return mk_snapshot(service, port, sp);
        }

        let target_port = svc
            .map(|svc| svc.target_port(port))
            .unwrap_or(TargetPort::Number(port));
        let (addrs, resource_version) = svc
            .map(|svc| svc.addrs(&service.namespace, &target_port, &self.pods))
            .unwrap_or_default();
        let mut endpoints = addrs.into_values().collect::<Vec<_>>();
        endpoints.sort_by_key(|ep| ep.addr);
        ServicePortSnapshot {
            service: service.clone(),
            port,
            target_port,
            endpoints,
            resource_version,
            exists: svc.map_or(false, |svc| svc.spec.is_some()),
        }
    }

    /// Returns the state of every known service port, ordered by service and
    /// port.
    pub fn endpoints_snapshot(&self) -> Vec<ServicePortSnapshot> {
        let mut snapshots = self
            .services
            .iter()
            .flat_map(|(service, svc)| {
                svc.ports
                    .iter()
                    .map(move |(port, sp)| mk_snapshot(service, *port, sp))
            })
            .collect::<Vec<_>>();
        snapshots.sort_by(|a, b| (&a.service, a.port).cmp(&(&b.service, b.port)));
        snapshots
    }

    /// Lists pods with their top-level owners.
    pub fn pods(&self, namespace: Option<&str>) -> Vec<PodSummary> {
        self.pods.pods(namespace)
    }

    pub(crate) fn service_ports(&self) -> usize {
        self.services.values().map(|svc| svc.ports.len()).sum()
    }

    pub(crate) fn endpoints_listeners(&self) -> usize {
        self.services
            .values()
            .flat_map(|svc| svc.ports.values())
            .map(|sp| sp.listeners.len())
            .sum()
    }

    pub(crate) fn profile_listeners(&self) -> usize {
        self.profiles.listeners()
    }

    pub(crate) fn profiles_len(&self) -> usize {
        self.profiles.len()
    }

    pub(crate) fn pod_index(&self) -> &PodIndex {
        &self.pods
    }

    /// Recomputes the services in a namespace whose endpoints reference any of
    /// the given IPs.
    fn reresolve(&mut self, ns: &str, ips: &[IpAddr]) {
        if ips.is_empty() {
            return;
        }
        for (service, svc) in self.services.iter_mut() {
            let referenced = service.namespace == ns
                && svc
                    .endpoints
                    .as_ref()
                    .map_or(false, |ep| ips.iter().any(|ip| ep.contains_ip(*ip)));
            if referenced {
                debug!(%service, "Re-resolving endpoint owners");
                svc.refresh(ns, &self.pods, self.cluster_info.listener_queue_capacity);
            }
        }
    }

    /// Drops services that have no resources and no listeners.
    fn gc(&mut self) {
        self.services.retain(|_, svc| {
            svc.spec.is_some()
                || svc.endpoints.is_some()
                || svc.ports.values().any(|sp| !sp.listeners.is_empty())
        });
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Service> for Index {
    fn apply(&mut self, service: k8s::Service) {
        let ns = service.namespace().unwrap_or_default();
        let name = service.name_unchecked();
        let spec = service
            .spec
            .and_then(|spec| spec.ports)
            .into_iter()
            .flatten()
            .filter_map(|sp| {
                let port = ports::from_i32(sp.port)?;
                Some((port, target_port(port, sp.target_port)))
            })
            .collect::<PortMap<_>>();

        let service = ServiceRef::new(ns, name);
        debug!(%service, ports = spec.len(), "Indexing service");
        let svc = self.services.entry(service.clone()).or_default();
        svc.spec = Some(spec);
        svc.refresh(
            &service.namespace,
            &self.pods,
            self.cluster_info.listener_queue_capacity,
        );
    }

    fn delete(&mut self, namespace: String, name: String) {
        let service = ServiceRef::new(namespace, name);
        if let Some(svc) = self.services.get_mut(&service) {
            debug!(%service, "Deleting service");
            svc.spec = None;
            for sp in svc.ports.values_mut() {
                sp.clear();
            }
            svc.ports.retain(|_, sp| !sp.listeners.is_empty());
        }
        self.gc();
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Endpoints> for Index {
    fn apply(&mut self, endpoints: k8s::Endpoints) {
        let service = ServiceRef::new(
            endpoints.namespace().unwrap_or_default(),
            endpoints.name_unchecked(),
        );
        debug!(%service, "Indexing endpoints");
        let svc = self.services.entry(service.clone()).or_default();
        svc.endpoints = Some(EndpointsState::from_resource(endpoints));
        svc.refresh(
            &service.namespace,
            &self.pods,
            self.cluster_info.listener_queue_capacity,
        );
    }

    fn delete(&mut self, namespace: String, name: String) {
        let service = ServiceRef::new(namespace, name);
        if let Some(svc) = self.services.get_mut(&service) {
            debug!(%service, "Deleting endpoints");
            svc.endpoints = None;
            svc.refresh(
                &service.namespace,
                &self.pods,
                self.cluster_info.listener_queue_capacity,
            );
        }
        self.gc();
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Pod> for Index {
    fn apply(&mut self, pod: k8s::Pod) {
        let ns = pod.namespace().unwrap_or_default();
        let ips = self.pods.apply_pod(pod);
        self.reresolve(&ns, &ips);
    }

    fn delete(&mut self, namespace: String, name: String) {
        if let Some(ip) = self.pods.delete_pod(&namespace, &name) {
            self.reresolve(&namespace, &[ip]);
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::ReplicaSet> for Index {
    fn apply(&mut self, rs: k8s::ReplicaSet) {
        self.pods.apply_replica_set(rs);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.pods.delete_replica_set(&namespace, &name);
    }
}

impl kubert::index::IndexNamespacedResource<ServiceProfile> for Index {
    fn apply(&mut self, profile: ServiceProfile) {
        let ns = profile.namespace().unwrap_or_default();
        let name = profile.name_unchecked();
        debug!(%ns, %name, "Indexing profile");
        self.profiles
            .apply(ns, name, profile.spec, &self.cluster_info);
    }

    fn delete(&mut self, namespace: String, name: String) {
        debug!(%namespace, %name, "Deleting profile");
        self.profiles.delete(namespace, name, &self.cluster_info);
    }
}

// === impl Service ===

impl Service {
    /// The target port for a service port. Undeclared ports target themselves.
    fn target_port(&self, port: NonZeroU16) -> TargetPort {
        self.spec
            .as_ref()
            .and_then(|spec| spec.get(&port))
            .cloned()
            .unwrap_or(TargetPort::Number(port))
    }

    /// Ports that are materialized without listeners.
    fn declared_ports(&self) -> Vec<NonZeroU16> {
        self.spec
            .as_ref()
            .map(|spec| spec.keys().copied().collect())
            .unwrap_or_default()
    }

    /// The addresses that serve a target port. A service without a service
    /// resource has no addresses, even if its endpoints remain.
    fn addrs(
        &self,
        ns: &str,
        target_port: &TargetPort,
        pods: &PodIndex,
    ) -> (HashMap<SocketAddr, Endpoint>, Option<String>) {
        match (&self.spec, &self.endpoints) {
            (Some(_), Some(ep)) => (
                ep.addrs(ns, target_port, pods),
                ep.resource_version.clone(),
            ),
            _ => Default::default(),
        }
    }

    fn port_or_default(
        &mut self,
        ns: &str,
        port: NonZeroU16,
        pods: &PodIndex,
        capacity: usize,
    ) -> &mut ServicePort {
        let target_port = self.target_port(port);
        let exists = self.spec.is_some();
        match self.ports.entry(port) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let mut sp = ServicePort::new(target_port, exists, capacity);
                if let (Some(_), Some(ep)) = (&self.spec, &self.endpoints) {
                    let addrs = ep.addrs(ns, &sp.target_port, pods);
                    sp.update(addrs, ep.resource_version.clone(), exists);
                }
                entry.insert(sp)
            }
        }
    }

    /// Recomputes every port of the service from its current resources.
    fn refresh(&mut self, ns: &str, pods: &PodIndex, capacity: usize) {
        let declared = self.declared_ports();
        let exists = self.spec.is_some();
        for port in &declared {
            let target_port = self.target_port(*port);
            self.ports
                .entry(*port)
                .or_insert_with(|| ServicePort::new(target_port, exists, capacity));
        }
        self.ports
            .retain(|port, sp| declared.contains(port) || !sp.listeners.is_empty());

        let ports = self.ports.keys().copied().collect::<Vec<_>>();
        for port in ports {
            let target_port = self.target_port(port);
            let (addrs, resource_version) = self.addrs(ns, &target_port, pods);
            if let Some(sp) = self.ports.get_mut(&port) {
                sp.target_port = target_port;
                sp.update(addrs, resource_version, exists);
            }
        }
    }
}

fn target_port(port: NonZeroU16, target: Option<k8s::IntOrString>) -> TargetPort {
    match target {
        Some(k8s::IntOrString::Int(n)) => {
            ports::from_i32(n).map_or(TargetPort::Number(port), TargetPort::Number)
        }
        Some(k8s::IntOrString::String(s)) if !s.is_empty() => match s.parse::<NonZeroU16>() {
            Ok(n) => TargetPort::Number(n),
            Err(_) => TargetPort::Name(s),
        },
        _ => TargetPort::Number(port),
    }
}

fn mk_snapshot(service: &ServiceRef, port: NonZeroU16, sp: &ServicePort) -> ServicePortSnapshot {
    let mut endpoints = sp.addrs.values().cloned().collect::<Vec<Endpoint>>();
    endpoints.sort_by_key(|ep| ep.addr);
    ServicePortSnapshot {
        service: service.clone(),
        port,
        target_port: sp.target_port.clone(),
        endpoints,
        resource_version: sp.resource_version.clone(),
        exists: sp.exists,
    }
}
