use crate::Error;
use serde::Serialize;
use std::{fmt, str::FromStr};

/// The kinds of resources that metrics may be aggregated by.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Authority,
    DaemonSet,
    Deployment,
    Job,
    Namespace,
    Pod,
    ReplicationController,
    ReplicaSet,
    Service,
    ServiceProfile,
    StatefulSet,
}

/// The kinds queried, in order, when a summary is requested for `all`.
pub const STAT_ALL_RESOURCE_KINDS: [ResourceKind; 7] = [
    ResourceKind::DaemonSet,
    ResourceKind::StatefulSet,
    ResourceKind::Deployment,
    ResourceKind::ReplicationController,
    ResourceKind::Pod,
    ResourceKind::Service,
    ResourceKind::Authority,
];

/// Selects resources of a kind. Empty fields are unconstrained.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resource {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
}

// === impl ResourceKind ===

impl ResourceKind {
    /// Parses a resource type that may be `all`.
    pub fn parse_many(s: &str) -> Result<Vec<Self>, Error> {
        if s == "all" {
            return Ok(STAT_ALL_RESOURCE_KINDS.to_vec());
        }
        s.parse().map(|kind| vec![kind])
    }

    pub fn canonical_name(&self) -> &'static str {
        match self {
            Self::Authority => "authority",
            Self::DaemonSet => "daemonset",
            Self::Deployment => "deployment",
            Self::Job => "job",
            Self::Namespace => "namespace",
            Self::Pod => "pod",
            Self::ReplicationController => "replicationcontroller",
            Self::ReplicaSet => "replicaset",
            Self::Service => "service",
            Self::ServiceProfile => "serviceprofile",
            Self::StatefulSet => "statefulset",
        }
    }

    pub fn short_name(&self) -> &'static str {
        match self {
            Self::Authority => "au",
            Self::DaemonSet => "ds",
            Self::Deployment => "deploy",
            Self::Job => "job",
            Self::Namespace => "ns",
            Self::Pod => "po",
            Self::ReplicationController => "rc",
            Self::ReplicaSet => "rs",
            Self::Service => "svc",
            Self::ServiceProfile => "sp",
            Self::StatefulSet => "sts",
        }
    }

    /// The metric label that identifies resources of this kind. Jobs use
    /// `k8s_job` so as not to conflict with Prometheus' `job` label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Job => "k8s_job",
            kind => kind.canonical_name(),
        }
    }

    /// Authorities are not Kubernetes resources.
    pub fn is_k8s(&self) -> bool {
        *self != Self::Authority
    }
}

impl FromStr for ResourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "au" | "authority" | "authorities" => Ok(Self::Authority),
            "ds" | "daemonset" | "daemonsets" => Ok(Self::DaemonSet),
            "deploy" | "deployment" | "deployments" => Ok(Self::Deployment),
            "job" | "jobs" => Ok(Self::Job),
            "ns" | "namespace" | "namespaces" => Ok(Self::Namespace),
            "po" | "pod" | "pods" => Ok(Self::Pod),
            "rc" | "replicationcontroller" | "replicationcontrollers" => {
                Ok(Self::ReplicationController)
            }
            "rs" | "replicaset" | "replicasets" => Ok(Self::ReplicaSet),
            "svc" | "service" | "services" => Ok(Self::Service),
            "sp" | "serviceprofile" | "serviceprofiles" => Ok(Self::ServiceProfile),
            "sts" | "statefulset" | "statefulsets" => Ok(Self::StatefulSet),
            _ => Err(Error::invalid(format!(
                "cannot find Kubernetes canonical name from friendly name [{s}]"
            ))),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.canonical_name().fmt(f)
    }
}

// === impl Resource ===

impl Resource {
    pub fn new(kind: ResourceKind, namespace: impl ToString, name: impl ToString) -> Self {
        Self {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Indicates whether this resource selects a pod, given the pod's
    /// top-level owner. Services and authorities select no pods.
    pub fn selects_pod(&self, namespace: &str, pod: &str, owner_kind: &str, owner: &str) -> bool {
        let in_ns = self.namespace.is_empty() || self.namespace == namespace;
        match self.kind {
            ResourceKind::Namespace => self.name.is_empty() || self.name == namespace,
            ResourceKind::Pod => in_ns && (self.name.is_empty() || self.name == pod),
            ResourceKind::Authority | ResourceKind::Service | ResourceKind::ServiceProfile => false,
            kind => {
                in_ns
                    && kind.canonical_name() == owner_kind
                    && (self.name.is_empty() || self.name == owner)
            }
        }
    }
}
