/// Holds cluster metadata.
#[derive(Clone, Debug)]
pub struct ClusterInfo {
    /// The namespace where the linkerd control plane is deployed. Profiles in
    /// this namespace apply to services in all namespaces.
    pub control_plane_ns: String,

    /// E.g. "cluster.local"
    pub dns_domain: String,

    /// The number of undelivered updates a listener may accumulate before it
    /// is unsubscribed.
    pub listener_queue_capacity: usize,
}

impl ClusterInfo {
    /// The name of the profile resource for a service, e.g.
    /// `voting.emojivoto.svc.cluster.local`.
    pub(crate) fn profile_name(&self, ns: &str, svc: &str) -> String {
        format!("{svc}.{ns}.svc.{}", self.dns_domain)
    }
}

impl Default for ClusterInfo {
    fn default() -> Self {
        Self {
            control_plane_ns: "linkerd".to_string(),
            dns_domain: "cluster.local".to_string(),
            listener_queue_capacity: 100,
        }
    }
}
