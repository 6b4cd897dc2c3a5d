//! Resolves backend addresses to the pods, and top-level workloads, that own
//! them.

use ahash::AHashMap as HashMap;
use linkerd_destination_core::Owner;
use linkerd_destination_k8s_api::{self as k8s, ResourceExt};
use serde::Serialize;
use std::net::IpAddr;
use tracing::{debug, trace};

/// Indexes pods and replica sets by namespace.
#[derive(Debug, Default)]
pub(crate) struct PodIndex {
    by_ns: HashMap<String, Namespace>,
}

/// A pod as reported by the pod listing API.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSummary {
    pub namespace: String,
    pub name: String,
    pub ip: Option<IpAddr>,
    pub phase: Option<String>,
    pub owner_kind: String,
    pub owner_name: String,

    /// The control plane namespace recorded when the pod's proxy was injected.
    pub control_plane_ns: Option<String>,
}

#[derive(Debug, Default)]
struct Namespace {
    pods: HashMap<String, Pod>,
    pods_by_ip: HashMap<IpAddr, String>,
    replica_sets: HashMap<String, Vec<ParentRef>>,
}

#[derive(Debug)]
struct Pod {
    ip: Option<IpAddr>,
    phase: Option<String>,
    parents: Vec<ParentRef>,
    control_plane_ns: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct ParentRef {
    kind: String,
    name: String,
}

const CONTROL_PLANE_NS_LABEL: &str = "linkerd.io/control-plane-ns";

// === impl PodIndex ===

impl PodIndex {
    /// Records a pod, returning the IPs whose owner may have changed: the pod's
    /// current IP and any IP it previously held.
    pub(crate) fn apply_pod(&mut self, pod: k8s::Pod) -> Vec<IpAddr> {
        let ns = pod.namespace().unwrap_or_default();
        let name = pod.name_unchecked();
        let status = pod.status.as_ref();
        let ip = status
            .and_then(|s| s.pod_ip.as_deref())
            .filter(|ip| !ip.is_empty())
            .and_then(|ip| match ip.parse::<IpAddr>() {
                Ok(ip) => Some(ip),
                Err(error) => {
                    debug!(%error, pod = %name, %ns, "Ignoring invalid pod IP");
                    None
                }
            });
        let pod_state = Pod {
            ip,
            phase: status.and_then(|s| s.phase.clone()),
            parents: parents(&pod.metadata),
            control_plane_ns: pod.labels().get(CONTROL_PLANE_NS_LABEL).cloned(),
        };

        let mut ips = Vec::with_capacity(2);
        let index = self.by_ns.entry(ns).or_default();
        if let Some(prior) = index.pods.insert(name.clone(), pod_state) {
            if let Some(prior_ip) = prior.ip.filter(|prior_ip| Some(*prior_ip) != ip) {
                index.forget_ip(prior_ip, &name);
                ips.push(prior_ip);
            }
        }
        if let Some(ip) = ip {
            index.pods_by_ip.insert(ip, name);
            ips.push(ip);
        }
        ips
    }

    /// Forgets a pod, returning its IP.
    pub(crate) fn delete_pod(&mut self, ns: &str, name: &str) -> Option<IpAddr> {
        let index = self.by_ns.get_mut(ns)?;
        let pod = index.pods.remove(name)?;
        if let Some(ip) = pod.ip {
            index.forget_ip(ip, name);
        }
        if index.is_empty() {
            self.by_ns.remove(ns);
        }
        pod.ip
    }

    pub(crate) fn apply_replica_set(&mut self, rs: k8s::ReplicaSet) {
        let ns = rs.namespace().unwrap_or_default();
        let parents = parents(&rs.metadata);
        self.by_ns
            .entry(ns)
            .or_default()
            .replica_sets
            .insert(rs.name_unchecked(), parents);
    }

    pub(crate) fn delete_replica_set(&mut self, ns: &str, name: &str) {
        if let Some(index) = self.by_ns.get_mut(ns) {
            index.replica_sets.remove(name);
            if index.is_empty() {
                self.by_ns.remove(ns);
            }
        }
    }

    /// Finds the owner of an endpoint address.
    ///
    /// The endpoint's target reference is preferred when it names a pod;
    /// otherwise the pod is looked up by IP within the namespace. Returns `None`
    /// when no pod matches.
    pub(crate) fn resolve(
        &self,
        ns: &str,
        ip: IpAddr,
        target: Option<&k8s::ObjectReference>,
    ) -> Option<Owner> {
        let by_ref = target
            .filter(|t| t.kind.as_deref() == Some("Pod"))
            .and_then(|t| {
                let pod_ns = t.namespace.as_deref().unwrap_or(ns);
                let name = t.name.as_deref()?;
                let pod = self.by_ns.get(pod_ns)?.pods.get(name)?;
                Some((pod_ns, name, pod))
            });
        let (pod_ns, name, pod) = match by_ref {
            Some(found) => found,
            None => {
                let index = self.by_ns.get(ns)?;
                let name = index.pods_by_ip.get(&ip)?;
                (ns, name.as_str(), index.pods.get(name)?)
            }
        };

        let (kind, workload) = self.workload(pod_ns, name, pod);
        trace!(%ip, pod = %name, %kind, %workload, "Resolved owner");
        Some(Owner {
            namespace: pod_ns.to_string(),
            pod: name.to_string(),
            kind,
            name: workload,
        })
    }

    /// Lists pods, optionally restricted to a namespace.
    pub(crate) fn pods(&self, ns: Option<&str>) -> Vec<PodSummary> {
        let mut pods = self
            .by_ns
            .iter()
            .filter(|(pod_ns, _)| ns.map_or(true, |ns| ns == pod_ns.as_str()))
            .flat_map(|(pod_ns, index)| {
                index.pods.iter().map(move |(name, pod)| {
                    let (owner_kind, owner_name) = self.workload(pod_ns, name, pod);
                    PodSummary {
                        namespace: pod_ns.clone(),
                        name: name.clone(),
                        ip: pod.ip,
                        phase: pod.phase.clone(),
                        owner_kind,
                        owner_name,
                        control_plane_ns: pod.control_plane_ns.clone(),
                    }
                })
            })
            .collect::<Vec<_>>();
        pods.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        pods
    }

    pub(crate) fn len(&self, ns: &str) -> usize {
        self.by_ns.get(ns).map_or(0, |index| index.pods.len())
    }

    pub(crate) fn namespaces(&self) -> impl Iterator<Item = &str> + '_ {
        self.by_ns.keys().map(String::as_str)
    }

    /// Walks a pod's owner references to its top-level workload.
    ///
    /// Pods with zero or several owners are their own workload. A replica set
    /// owner is replaced by its deployment, if it has one.
    fn workload(&self, ns: &str, name: &str, pod: &Pod) -> (String, String) {
        let parent = match pod.parents.as_slice() {
            [parent] => parent,
            _ => return ("pod".to_string(), name.to_string()),
        };

        if parent.kind != "ReplicaSet" {
            return (parent.kind.to_lowercase(), parent.name.clone());
        }

        let rs_parents = self
            .by_ns
            .get(ns)
            .and_then(|index| index.replica_sets.get(&parent.name));
        match rs_parents.and_then(|ps| ps.first()) {
            Some(ParentRef { kind, name }) if kind == "Deployment" => {
                ("deployment".to_string(), name.clone())
            }
            _ => ("replicaset".to_string(), parent.name.clone()),
        }
    }
}

// === impl Namespace ===

impl Namespace {
    fn forget_ip(&mut self, ip: IpAddr, name: &str) {
        if self.pods_by_ip.get(&ip).map(String::as_str) == Some(name) {
            self.pods_by_ip.remove(&ip);
        }
    }

    fn is_empty(&self) -> bool {
        self.pods.is_empty() && self.replica_sets.is_empty()
    }
}

fn parents(meta: &k8s::ObjectMeta) -> Vec<ParentRef> {
    meta.owner_references
        .iter()
        .flatten()
        .map(|r| ParentRef {
            kind: r.kind.clone(),
            name: r.name.clone(),
        })
        .collect()
}
